use super::{
    archive::{ArchiveParser, ParseOptions},
    bind_info_ffi::{NamedParameter, get_named_parameter_bool, get_named_parameter_varchar},
    error::{ErrorAccumulator, Warning},
    log,
    record::{DateTimeError, GameRecord},
};
use duckdb::{
    core::{DataChunkHandle, Inserter, LogicalTypeHandle, LogicalTypeId},
    vtab::{BindInfo, InitInfo, TableFunctionInfo, VTab},
};
use libduckdb_sys::duckdb_timestamp;
use std::borrow::Cow;
use std::ffi::CString;
use std::fs::File;
use std::io::{BufReader, Read};
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use zstd::stream::read::Decoder as ZstdDecoder;

pub struct ReadPgnArchiveBindData {
    paths: Vec<PathBuf>,
    compression: CompressionMode,
    options: ParseOptions,
}

pub struct ReadPgnArchiveInitData {
    state: Mutex<SharedState>,
}

pub struct ReadPgnArchiveVTab;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum CompressionMode {
    Plain,
    Zstd,
}

const PATH_PATTERN_PARAM_INDEX: u64 = 0;
const ROWS_PER_CHUNK: usize = 2048;
const READ_PGN_ARCHIVE_COLUMN_COUNT: usize = 10;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Column {
    Tags = 0,
    Event = 1,
    White = 2,
    Black = 3,
    Result = 4,
    UtcDateTime = 5,
    Movetext = 6,
    Pgn = 7,
    Diagnostics = 8,
    Source = 9,
}

impl Column {
    const fn index(self) -> usize {
        self as usize
    }

    fn name(self) -> &'static str {
        COLUMNS[self.index()].name
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ColumnType {
    Varchar,
    Timestamp,
}

impl ColumnType {
    fn to_handle(self) -> LogicalTypeHandle {
        match self {
            Self::Varchar => LogicalTypeHandle::from(LogicalTypeId::Varchar),
            Self::Timestamp => LogicalTypeHandle::from(LogicalTypeId::Timestamp),
        }
    }
}

struct ColumnDef {
    name: &'static str,
    logical_type: ColumnType,
}

const fn varchar(name: &'static str) -> ColumnDef {
    ColumnDef {
        name,
        logical_type: ColumnType::Varchar,
    }
}

const COLUMNS: [ColumnDef; READ_PGN_ARCHIVE_COLUMN_COUNT] = [
    varchar("tags"),
    varchar("Event"),
    varchar("White"),
    varchar("Black"),
    varchar("Result"),
    ColumnDef {
        name: "UTCDateTime",
        logical_type: ColumnType::Timestamp,
    },
    varchar("movetext"),
    varchar("pgn"),
    varchar("diagnostics"),
    varchar("Source"),
];

impl CompressionMode {
    fn parse(raw: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let normalized = raw.trim();
        if normalized.eq_ignore_ascii_case("zstd") {
            Ok(Self::Zstd)
        } else {
            Err(format!(
                "Invalid compression value '{}'. Supported values: 'zstd' or NULL/omitted.",
                normalized
            )
            .into())
        }
    }

    /// File name endings accepted for this mode.
    fn extensions(self) -> &'static [&'static str] {
        match self {
            Self::Plain => &[".pgn"],
            Self::Zstd => &[".pgn.zst", ".zst"],
        }
    }
}

fn resolve_compression_mode(
    bind: &BindInfo,
) -> Result<CompressionMode, Box<dyn std::error::Error>> {
    match get_named_parameter_varchar(bind, "compression")? {
        NamedParameter::Missing | NamedParameter::Null => Ok(CompressionMode::Plain),
        NamedParameter::Value(raw) if raw.trim().eq_ignore_ascii_case("null") => {
            Ok(CompressionMode::Plain)
        }
        NamedParameter::Value(raw) => CompressionMode::parse(&raw),
    }
}

/// Expand `pattern` to archive paths; plain paths are taken as-is.
fn expand_path_pattern(pattern: &str) -> Result<Vec<PathBuf>, Box<dyn std::error::Error>> {
    if pattern.contains('*') || pattern.contains('?') {
        let mut paths: Vec<PathBuf> = glob::glob(pattern)?
            .filter_map(|entry| entry.ok())
            .collect();
        paths.sort();
        Ok(paths)
    } else {
        Ok(vec![PathBuf::from(pattern)])
    }
}

fn check_archive_path(path: &Path, compression: CompressionMode) -> Result<(), String> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    if compression
        .extensions()
        .iter()
        .any(|ext| file_name.ends_with(ext))
    {
        Ok(())
    } else {
        Err(format!(
            "Expected pgn extension for file '{}'",
            path.display()
        ))
    }
}

pub type PgnInput = Box<dyn Read + Send>;

fn open_input_stream(path: &Path, compression: CompressionMode) -> Result<PgnInput, String> {
    check_archive_path(path, compression)?;

    let file =
        File::open(path).map_err(|e| format!("Failed to open file '{}': {}", path.display(), e))?;

    match compression {
        CompressionMode::Plain => Ok(Box::new(file)),
        CompressionMode::Zstd => ZstdDecoder::new(file)
            .map(|decoder| Box::new(decoder) as PgnInput)
            .map_err(|e| {
                format!(
                    "Failed to initialize zstd decoder for '{}': {}",
                    path.display(),
                    e
                )
            }),
    }
}

fn sanitize_for_cstring<'a>(
    value: &'a str,
    field_name: &str,
    diagnostics: &mut ErrorAccumulator,
) -> Cow<'a, str> {
    if value.contains('\0') {
        diagnostics.push(&format!("Sanitized interior NUL in {}", field_name));
        Cow::Owned(value.replace('\0', " "))
    } else {
        Cow::Borrowed(value)
    }
}

fn sanitize_for_cstring_silent(value: &str) -> Cow<'_, str> {
    if value.contains('\0') {
        Cow::Owned(value.replace('\0', " "))
    } else {
        Cow::Borrowed(value)
    }
}

/// One parser per open archive; parked in [`SharedState`] between chunks.
pub struct PgnReaderState {
    parser: ArchiveParser<BufReader<PgnInput>, Vec<Warning>>,
    path_idx: usize,
    games_read: usize,
}

impl PgnReaderState {
    pub fn new(input: PgnInput, path_idx: usize, options: ParseOptions) -> Self {
        Self {
            parser: ArchiveParser::with_diagnostics(BufReader::new(input), options, Vec::new()),
            path_idx,
            games_read: 0,
        }
    }
}

pub struct SharedState {
    next_path_idx: usize,
    available_readers: Vec<PgnReaderState>,
}

/// A game plus everything derived from it for output.
struct GameRow {
    game: GameRecord,
    utc_datetime: Option<duckdb_timestamp>,
    diagnostics: ErrorAccumulator,
}

enum ReadNextGameOutcome {
    GameReady(GameRow),
    ReaderFinished,
}

/// Split warnings raised while scanning up to the latest game.
///
/// Duplicate tags belong to the game just produced, unless a partial game was
/// skipped after them, in which case they belonged to the skipped game.
fn route_warnings(
    warnings: Vec<Warning>,
    source_path: &Path,
    row_diagnostics: &mut ErrorAccumulator,
) {
    let mut pending_duplicates: Vec<Warning> = Vec::new();

    for warning in warnings {
        match warning {
            Warning::DuplicateTag { .. } => pending_duplicates.push(warning),
            Warning::PartialGameSkipped { .. } => {
                log_warnings(mem::take(&mut pending_duplicates), source_path);
                log::warn(format!("{}:{}", source_path.display(), warning));
            }
        }
    }

    for duplicate in pending_duplicates {
        row_diagnostics.push(&duplicate.to_string());
    }
}

fn log_warnings(warnings: Vec<Warning>, source_path: &Path) {
    for warning in warnings {
        log::warn(format!("{}:{}", source_path.display(), warning));
    }
}

fn build_row(game: GameRecord, mut diagnostics: ErrorAccumulator) -> GameRow {
    let utc_datetime = match game.utc_datetime() {
        Ok(played) => Some(duckdb_timestamp {
            micros: played.timestamp_micros(),
        }),
        Err(DateTimeError::MissingTag(_)) => None,
        Err(err @ DateTimeError::InvalidTag { .. }) => {
            diagnostics.push(&err.to_string());
            None
        }
    };

    GameRow {
        game,
        utc_datetime,
        diagnostics,
    }
}

fn read_next_game(
    reader: &mut PgnReaderState,
    source_path: &Path,
) -> Result<ReadNextGameOutcome, Box<dyn std::error::Error>> {
    let next = reader.parser.next();
    let warnings = mem::take(reader.parser.diagnostics_mut());

    match next {
        Some(Ok(game)) => {
            reader.games_read += 1;
            let mut row_diagnostics = ErrorAccumulator::default();
            route_warnings(warnings, source_path, &mut row_diagnostics);
            Ok(ReadNextGameOutcome::GameReady(build_row(
                game,
                row_diagnostics,
            )))
        }
        Some(Err(err)) => {
            log_warnings(warnings, source_path);
            let msg = format!("{}:{}", source_path.display(), err);
            log::error(&msg);
            Err(msg.into())
        }
        None => {
            log_warnings(warnings, source_path);
            log::info(format!(
                "Finished '{}': {} game(s) over {} line(s)",
                source_path.display(),
                reader.games_read,
                reader.parser.line_number()
            ));
            Ok(ReadNextGameOutcome::ReaderFinished)
        }
    }
}

struct ChunkWriter<'a> {
    output: &'a mut DataChunkHandle,
    row_count: usize,
}

impl<'a> ChunkWriter<'a> {
    fn new(output: &'a mut DataChunkHandle) -> Self {
        Self {
            output,
            row_count: 0,
        }
    }

    fn is_full(&self) -> bool {
        self.row_count >= ROWS_PER_CHUNK
    }

    fn write_row(
        &mut self,
        row: GameRow,
        source_path: &Path,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let row_idx = self.row_count;
        let GameRow {
            game,
            utc_datetime,
            mut diagnostics,
        } = row;

        self.write_varchar(Column::Tags, row_idx, &game.tags_json(), &mut diagnostics)?;
        self.write_optional_varchar(Column::Event, row_idx, game.tag("Event"), &mut diagnostics)?;
        self.write_optional_varchar(Column::White, row_idx, game.tag("White"), &mut diagnostics)?;
        self.write_optional_varchar(Column::Black, row_idx, game.tag("Black"), &mut diagnostics)?;
        self.write_optional_varchar(
            Column::Result,
            row_idx,
            game.tag("Result"),
            &mut diagnostics,
        )?;
        self.write_optional_timestamp(Column::UtcDateTime, row_idx, utc_datetime);
        self.write_varchar(Column::Movetext, row_idx, game.move_text(), &mut diagnostics)?;
        self.write_varchar(Column::Pgn, row_idx, &game.to_pgn_string(), &mut diagnostics)?;
        self.write_varchar(
            Column::Source,
            row_idx,
            &source_path.to_string_lossy(),
            &mut diagnostics,
        )?;

        let mut diagnostics_vec = self.output.flat_vector(Column::Diagnostics.index());
        match diagnostics.take() {
            None => diagnostics_vec.set_null(row_idx),
            Some(message) => {
                let message = sanitize_for_cstring_silent(message.as_str());
                diagnostics_vec.insert(row_idx, CString::new(message.as_ref())?);
            }
        }

        self.row_count += 1;
        Ok(())
    }

    fn set_output_len(&mut self) {
        self.output.set_len(self.row_count);
    }

    fn write_varchar(
        &mut self,
        column: Column,
        row_idx: usize,
        value: &str,
        diagnostics: &mut ErrorAccumulator,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let vector = self.output.flat_vector(column.index());
        let sanitized = sanitize_for_cstring(value, column.name(), diagnostics);
        vector.insert(row_idx, CString::new(sanitized.as_ref())?);
        Ok(())
    }

    fn write_optional_varchar(
        &mut self,
        column: Column,
        row_idx: usize,
        value: Option<&str>,
        diagnostics: &mut ErrorAccumulator,
    ) -> Result<(), Box<dyn std::error::Error>> {
        match value {
            Some(value) => self.write_varchar(column, row_idx, value, diagnostics),
            None => {
                self.output.flat_vector(column.index()).set_null(row_idx);
                Ok(())
            }
        }
    }

    fn write_optional_timestamp(
        &mut self,
        column: Column,
        row_idx: usize,
        value: Option<duckdb_timestamp>,
    ) {
        let mut vector = self.output.flat_vector(column.index());
        if let Some(value) = value {
            vector.as_mut_slice::<duckdb_timestamp>()[row_idx] = value;
        } else {
            vector.set_null(row_idx);
        }
    }
}

fn acquire_reader(
    init_data: &ReadPgnArchiveInitData,
    bind_data: &ReadPgnArchiveBindData,
) -> Result<Option<PgnReaderState>, Box<dyn std::error::Error>> {
    loop {
        let path_idx = {
            let mut state = init_data
                .state
                .lock()
                .map_err(|_| "read_pgn_archive state lock poisoned")?;

            if let Some(reader) = state.available_readers.pop() {
                return Ok(Some(reader));
            }

            if state.next_path_idx < bind_data.paths.len() {
                let path_idx = state.next_path_idx;
                state.next_path_idx += 1;
                path_idx
            } else {
                return Ok(None);
            }
        };

        let path = &bind_data.paths[path_idx];
        match open_input_stream(path, bind_data.compression) {
            Ok(input_stream) => {
                log::info(format!("Reading '{}'", path.display()));
                return Ok(Some(PgnReaderState::new(
                    input_stream,
                    path_idx,
                    bind_data.options,
                )));
            }
            Err(err_msg) => {
                if bind_data.paths.len() == 1 {
                    return Err(err_msg.into());
                }

                log::warn(&err_msg);
            }
        }
    }
}

fn finalize_chunk(
    init_data: &ReadPgnArchiveInitData,
    current_reader_state: Option<PgnReaderState>,
    chunk_writer: &mut ChunkWriter<'_>,
) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(reader) = current_reader_state {
        let mut state = init_data
            .state
            .lock()
            .map_err(|_| "read_pgn_archive state lock poisoned")?;
        state.available_readers.push(reader);
    }

    chunk_writer.set_output_len();
    Ok(())
}

impl VTab for ReadPgnArchiveVTab {
    type InitData = ReadPgnArchiveInitData;
    type BindData = ReadPgnArchiveBindData;

    fn bind(bind: &BindInfo) -> Result<Self::BindData, Box<dyn std::error::Error>> {
        let pattern = bind.get_parameter(PATH_PATTERN_PARAM_INDEX).to_string();
        let compression = resolve_compression_mode(bind)?;
        let options = ParseOptions {
            include_partial_games: get_named_parameter_bool(bind, "include_partial_games")?
                .unwrap_or(false),
        };

        let paths = expand_path_pattern(&pattern)?;
        if paths.is_empty() {
            log::warn(format!("No files match '{}'", pattern));
        }

        for column in COLUMNS.iter() {
            bind.add_result_column(column.name, column.logical_type.to_handle());
        }

        Ok(ReadPgnArchiveBindData {
            paths,
            compression,
            options,
        })
    }

    fn init(_: &InitInfo) -> Result<Self::InitData, Box<dyn std::error::Error>> {
        Ok(ReadPgnArchiveInitData {
            state: Mutex::new(SharedState {
                next_path_idx: 0,
                available_readers: Vec::new(),
            }),
        })
    }

    fn func(
        func: &TableFunctionInfo<Self>,
        output: &mut DataChunkHandle,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let init_data = func.get_init_data();
        let bind_data = func.get_bind_data();
        let mut chunk_writer = ChunkWriter::new(output);
        let mut current_reader_state: Option<PgnReaderState> = None;

        while !chunk_writer.is_full() {
            if current_reader_state.is_none() {
                current_reader_state = acquire_reader(init_data, bind_data)?;
                if current_reader_state.is_none() {
                    break;
                }
            }

            if let Some(mut reader) = current_reader_state.take() {
                let source_path = &bind_data.paths[reader.path_idx];
                match read_next_game(&mut reader, source_path)? {
                    ReadNextGameOutcome::GameReady(row) => {
                        chunk_writer.write_row(row, source_path)?;
                        current_reader_state = Some(reader);
                    }
                    ReadNextGameOutcome::ReaderFinished => {
                        // Dropped here; the next iteration acquires new work.
                    }
                }
            }
        }

        finalize_chunk(init_data, current_reader_state, &mut chunk_writer)
    }

    fn parameters() -> Option<Vec<LogicalTypeHandle>> {
        Some(vec![
            LogicalTypeHandle::from(LogicalTypeId::Varchar), // path pattern (required)
        ])
    }

    fn named_parameters() -> Option<Vec<(String, LogicalTypeHandle)>> {
        Some(vec![
            (
                "compression".to_string(),
                LogicalTypeHandle::from(LogicalTypeId::Varchar),
            ),
            (
                "include_partial_games".to_string(),
                LogicalTypeHandle::from(LogicalTypeId::Boolean),
            ),
        ])
    }
}
