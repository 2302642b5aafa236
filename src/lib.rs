//! Line-oriented PGN archive parsing, exposed to DuckDB as `read_pgn_archive`.
//!
//! The parser expects archives the way game hosts export them: a block of
//! `[Key "Value"]` tag lines per game followed by one line with all of the
//! game's moves. Move text is kept verbatim and never interpreted.

pub mod archive;
mod bind_info_ffi;
pub mod error;
mod log;
mod reader;
pub mod record;
pub mod tag;

pub use archive::{ArchiveParser, ParseOptions};
pub use error::{
    Diagnostics, IgnoreDiagnostics, LogDiagnostics, MalformedTagReason, ParseError, Warning,
};
pub use record::{DateTimeError, GameRecord};
pub use tag::parse_tag_line;

use duckdb::{Connection, Result};
use duckdb_ext_macros::duckdb_extension;
use reader::ReadPgnArchiveVTab;
use std::error::Error;

#[duckdb_extension(name = "pgn_archive", api_version = "v1.0.0")]
pub unsafe fn extension_entrypoint(con: Connection) -> Result<(), Box<dyn Error>> {
    con.register_table_function::<ReadPgnArchiveVTab>("read_pgn_archive")?;

    Ok(())
}
