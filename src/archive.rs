use super::{
    error::{Diagnostics, LogDiagnostics, ParseError, Warning},
    log,
    record::GameRecord,
    tag::parse_tag_line,
};
use std::io::BufRead;
use std::iter::FusedIterator;
use std::mem;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseOptions {
    /// Emit games whose move line does not start at move 1 instead of skipping them.
    pub include_partial_games: bool,
}

/// Tags collected since the last record boundary.
#[derive(Debug, Default)]
struct Accumulator {
    pending_tags: Vec<(String, String)>,
    line_number: usize,
}

impl Accumulator {
    /// Returns `true` when `key` was already present and its value got replaced.
    fn insert(&mut self, key: String, value: String) -> bool {
        match self.pending_tags.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => {
                *slot = value;
                true
            }
            None => {
                self.pending_tags.push((key, value));
                false
            }
        }
    }

    fn take_tags(&mut self) -> Vec<(String, String)> {
        mem::take(&mut self.pending_tags)
    }
}

/// How a move line starts, judged by the number before its first `.`.
#[derive(Debug, PartialEq, Eq)]
enum StartingMove {
    First,
    /// Any other integer, kept as written since it may not fit an `i64`.
    Later(String),
}

fn starting_move(line: &str, line_number: usize) -> Result<StartingMove, ParseError> {
    let unexpected = || ParseError::UnexpectedLine { line: line_number };

    let period = line.find('.').ok_or_else(unexpected)?;
    let token = line[..period].trim();

    let digits = token.strip_prefix(['+', '-']).unwrap_or(token);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(unexpected());
    }

    // Integers too large for an i64 are still integers, just never 1.
    if token.parse::<i64>() == Ok(1) {
        Ok(StartingMove::First)
    } else {
        Ok(StartingMove::Later(token.to_string()))
    }
}

/// Lazily turns archive text into [`GameRecord`]s, one per move line.
///
/// Each game is expected to be a run of `[Key "Value"]` lines followed by a
/// single line holding all of its moves. Fatal errors are yielded once, after
/// which the iterator is exhausted. Warnings go to the `D` sink.
pub struct ArchiveParser<R, D = LogDiagnostics> {
    input: R,
    options: ParseOptions,
    diagnostics: D,
    state: Accumulator,
    line_buffer: String,
    finished: bool,
}

impl<R: BufRead> ArchiveParser<R> {
    pub fn new(input: R, options: ParseOptions) -> Self {
        Self::with_diagnostics(input, options, LogDiagnostics)
    }
}

impl<'a> ArchiveParser<&'a [u8]> {
    pub fn from_text(text: &'a str, options: ParseOptions) -> Self {
        Self::new(text.as_bytes(), options)
    }
}

impl<R: BufRead, D: Diagnostics> ArchiveParser<R, D> {
    pub fn with_diagnostics(input: R, options: ParseOptions, diagnostics: D) -> Self {
        Self {
            input,
            options,
            diagnostics,
            state: Accumulator::default(),
            line_buffer: String::with_capacity(256),
            finished: false,
        }
    }

    pub fn options(&self) -> ParseOptions {
        self.options
    }

    /// Last line read so far (1-based), or 0 before the first read.
    pub fn line_number(&self) -> usize {
        self.state.line_number
    }

    pub fn diagnostics(&self) -> &D {
        &self.diagnostics
    }

    pub fn diagnostics_mut(&mut self) -> &mut D {
        &mut self.diagnostics
    }

    fn next_record(&mut self) -> Result<Option<GameRecord>, ParseError> {
        loop {
            let line_number = self.state.line_number + 1;
            self.line_buffer.clear();
            let read = self
                .input
                .read_line(&mut self.line_buffer)
                .map_err(|source| ParseError::Io {
                    line: line_number,
                    source,
                })?;

            if read == 0 {
                if !self.state.pending_tags.is_empty() {
                    log::info(format!(
                        "dropping {} tag(s) with no move line at end of archive",
                        self.state.pending_tags.len()
                    ));
                }
                return Ok(None);
            }
            self.state.line_number = line_number;

            let line = self.line_buffer.trim();
            if line.is_empty() {
                continue;
            }

            if line.starts_with('[') {
                let (key, value) = parse_tag_line(line, line_number)?;
                let duplicate_key = key.clone();
                if self.state.insert(key, value) {
                    self.diagnostics.report(Warning::DuplicateTag {
                        line: line_number,
                        key: duplicate_key,
                    });
                }
                continue;
            }

            // Every other line holds one game's complete move text.
            let starting = starting_move(line, line_number)?;
            let tags = self.state.take_tags();

            match starting {
                StartingMove::First => {
                    return Ok(Some(GameRecord::new(tags, line.to_string())));
                }
                StartingMove::Later(_) if self.options.include_partial_games => {
                    return Ok(Some(GameRecord::new(tags, line.to_string())));
                }
                StartingMove::Later(move_number) => {
                    self.diagnostics.report(Warning::PartialGameSkipped {
                        line: line_number,
                        move_number,
                    });
                }
            }
        }
    }
}

impl<R: BufRead, D: Diagnostics> Iterator for ArchiveParser<R, D> {
    type Item = Result<GameRecord, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        match self.next_record() {
            Ok(Some(game)) => Some(Ok(game)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(err) => {
                self.finished = true;
                Some(Err(err))
            }
        }
    }
}

impl<R: BufRead, D: Diagnostics> FusedIterator for ArchiveParser<R, D> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MalformedTagReason;
    use std::io::{self, Read};

    fn parse_collecting(
        pgn: &str,
        include_partial_games: bool,
    ) -> (Vec<Result<GameRecord, ParseError>>, Vec<Warning>) {
        let mut parser = ArchiveParser::with_diagnostics(
            pgn.as_bytes(),
            ParseOptions {
                include_partial_games,
            },
            Vec::new(),
        );
        let results: Vec<_> = parser.by_ref().collect();
        let warnings = mem::take(parser.diagnostics_mut());
        (results, warnings)
    }

    fn games(pgn: &str) -> Vec<GameRecord> {
        let (results, _) = parse_collecting(pgn, false);
        results
            .into_iter()
            .collect::<Result<Vec<_>, _>>()
            .expect("archive should parse")
    }

    #[test]
    fn test_single_game() {
        let pgn = r#"[Event "Rated Blitz game"]
[White "alice"]
[Black "bob"]

1. e4 e5 2. Nf3 Nc6 1-0
"#;
        let games = games(pgn);
        assert_eq!(games.len(), 1);
        assert_eq!(games[0].tag("Event"), Some("Rated Blitz game"));
        assert_eq!(games[0].tag("White"), Some("alice"));
        assert_eq!(games[0].tag("Black"), Some("bob"));
        assert_eq!(games[0].move_text(), "1. e4 e5 2. Nf3 Nc6 1-0");
    }

    #[test]
    fn test_duplicate_tag_overwrites_and_warns() {
        let pgn = "[Event \"Foo\"]\n[Event \"Bar\"]\n1. e4 e5\n";
        let (results, warnings) = parse_collecting(pgn, false);

        assert_eq!(results.len(), 1);
        let game = results[0].as_ref().unwrap();
        assert_eq!(game.tag("Event"), Some("Bar"));
        assert_eq!(game.tag_count(), 1);
        assert_eq!(
            warnings,
            vec![Warning::DuplicateTag {
                line: 2,
                key: "Event".to_string(),
            }]
        );
    }

    #[test]
    fn test_duplicate_tag_keeps_first_position() {
        let pgn = "[Event \"Foo\"]\n[Site \"x\"]\n[Event \"Bar\"]\n1. e4\n";
        let game = games(pgn).remove(0);
        let keys: Vec<&str> = game.tag_keys().collect();
        assert_eq!(keys, vec!["Event", "Site"]);
    }

    #[test]
    fn test_partial_game_skipped_by_default() {
        let (results, warnings) = parse_collecting("2. e4 e5\n", false);
        assert!(results.is_empty());
        assert_eq!(
            warnings,
            vec![Warning::PartialGameSkipped {
                line: 1,
                move_number: "2".to_string(),
            }]
        );
    }

    #[test]
    fn test_partial_game_included_when_requested() {
        let (results, warnings) = parse_collecting("2. e4 e5\n", true);
        assert_eq!(results.len(), 1);
        let game = results[0].as_ref().unwrap();
        assert_eq!(game.tag_count(), 0);
        assert_eq!(game.move_text(), "2. e4 e5");
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_skipped_partial_game_discards_its_tags() {
        let pgn = r#"[Event "Truncated"]
17... Kh8 18. Qh5
[Event "Full"]
1. d4 d5
"#;
        let (results, warnings) = parse_collecting(pgn, false);
        assert_eq!(results.len(), 1);
        let game = results[0].as_ref().unwrap();
        assert_eq!(game.tag("Event"), Some("Full"));
        assert_eq!(game.tag_count(), 1);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].line(), 2);
    }

    #[test]
    fn test_missing_closing_bracket_halts() {
        let pgn = "[Event \"Test\"\n1. e4 e5\n";
        let mut parser = ArchiveParser::from_text(pgn, ParseOptions::default());

        match parser.next() {
            Some(Err(ParseError::MalformedTag { line, reason })) => {
                assert_eq!(line, 1);
                assert_eq!(reason, MalformedTagReason::MissingClosingBracket);
            }
            other => panic!("expected MalformedTag, got {other:?}"),
        }
        assert!(parser.next().is_none());
        assert!(parser.next().is_none());
    }

    #[test]
    fn test_multiple_tags_per_line_is_fatal() {
        let (results, _) = parse_collecting("[A \"1\"][B \"2\"]\n1. e4\n", false);
        assert_eq!(results.len(), 1);
        assert!(matches!(
            results[0],
            Err(ParseError::MalformedTag {
                line: 1,
                reason: MalformedTagReason::MultipleTags,
            })
        ));
    }

    #[test]
    fn test_unexpected_line_is_fatal() {
        let pgn = "[Event \"x\"]\n\ne4 e5 Nf3\n1. d4\n";
        let (results, _) = parse_collecting(pgn, true);
        assert_eq!(results.len(), 1);
        assert!(matches!(
            results[0],
            Err(ParseError::UnexpectedLine { line: 3 })
        ));
    }

    #[test]
    fn test_move_line_without_period_is_unexpected() {
        let (results, _) = parse_collecting("1-0\n", true);
        assert!(matches!(
            results[..],
            [Err(ParseError::UnexpectedLine { line: 1 })]
        ));
    }

    #[test]
    fn test_two_consecutive_games_keep_their_own_tags() {
        let pgn = r#"[Event "First"]
[White "a"]

1. e4 e5

[Event "Second"]
[Black "b"]

1. d4 d5
"#;
        let games = games(pgn);
        assert_eq!(games.len(), 2);

        assert_eq!(games[0].tag("Event"), Some("First"));
        assert_eq!(games[0].tag("White"), Some("a"));
        assert_eq!(games[0].tag("Black"), None);
        assert_eq!(games[0].move_text(), "1. e4 e5");

        assert_eq!(games[1].tag("Event"), Some("Second"));
        assert_eq!(games[1].tag("White"), None);
        assert_eq!(games[1].tag("Black"), Some("b"));
        assert_eq!(games[1].move_text(), "1. d4 d5");
    }

    #[test]
    fn test_game_without_tags_follows_previous_game() {
        let games = games("1. e4 e5\n1. d4 d5\n");
        assert_eq!(games.len(), 2);
        assert_eq!(games[1].tag_count(), 0);
    }

    #[test]
    fn test_blank_lines_do_not_affect_records() {
        let compact = "[Event \"E\"]\n[Site \"S\"]\n1. e4 e5 1/2-1/2\n";
        let spaced = "\n\n[Event \"E\"]\n\n   \n[Site \"S\"]\n\n\n1. e4 e5 1/2-1/2\n\n";
        assert_eq!(games(compact), games(spaced));
    }

    #[test]
    fn test_surrounding_whitespace_is_trimmed() {
        let games = games("  [Event \"E\"]  \r\n\t1. e4 e5  \r\n");
        assert_eq!(games[0].tag("Event"), Some("E"));
        assert_eq!(games[0].move_text(), "1. e4 e5");
    }

    #[test]
    fn test_dangling_tags_are_dropped() {
        let pgn = "[Event \"A\"]\n1. e4\n[Event \"B\"]\n[Site \"x\"]\n";
        let (results, warnings) = parse_collecting(pgn, false);
        assert_eq!(results.len(), 1);
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_empty_archive() {
        assert!(games("").is_empty());
        assert!(games("\n\n  \n").is_empty());
    }

    #[test]
    fn test_round_trip_through_rendering() {
        let pgn = r#"[Event "Live Chess"]
[Site "Chess.com"]
[UTCDate "2023.04.09"]
[UTCTime "18:07:42"]
[TimeControl "600"]

1. e4 {[%clk 0:09:58.9]} 1... c5 {[%clk 0:09:57]} 2. Nf3 1-0
"#;
        let original = games(pgn).remove(0);
        let rendered = original.to_pgn_string();
        let reparsed = games(&rendered);

        assert_eq!(reparsed, vec![original]);
    }

    fn owned_tags(tags: &[(&str, &str)]) -> Vec<(String, String)> {
        tags.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_round_trip_over_varied_records() {
        let many_tags: Vec<(String, String)> = (0..40)
            .map(|i| (format!("Tag{i}"), format!("value {i}")))
            .collect();

        let records = vec![
            GameRecord::new(Vec::new(), "1. e4 e5 2. Nf3 *".to_string()),
            GameRecord::new(Vec::new(), "5. Nf3 Nc6 6. Bb5".to_string()),
            GameRecord::new(Vec::new(), "23... Qxd4 24. Rxd4 0-1".to_string()),
            GameRecord::new(
                owned_tags(&[("Event", ""), ("WhiteTitle", ""), ("Result", "*")]),
                "1. d4 *".to_string(),
            ),
            GameRecord::new(
                owned_tags(&[
                    ("Site", "https://lichess.org/AbCdEfGh"),
                    ("Opening", "Sicilian Defense: Najdorf, 6. Be3"),
                ]),
                "1. e4 c5 2. Nf3 d6 1/2-1/2".to_string(),
            ),
            GameRecord::new(
                owned_tags(&[("Annotator", "{curly} (paren) ünïcödé"), ("Round", "-")]),
                "1. c4 { [%clk 0:05:00] } e5".to_string(),
            ),
            GameRecord::new(many_tags, "1. Nf3 d5 2. g3".to_string()),
            GameRecord::new(
                owned_tags(&[("Event", "Truncated")]),
                "40. Kg2 Kf7".to_string(),
            ),
        ];

        for original in records {
            let rendered = original.to_pgn_string();
            let (reparsed, warnings) = parse_collecting(&rendered, true);
            let reparsed: Vec<GameRecord> = reparsed
                .into_iter()
                .collect::<Result<_, _>>()
                .unwrap_or_else(|err| panic!("failed to reparse {rendered:?}: {err}"));

            assert_eq!(reparsed, vec![original], "rendered as {rendered:?}");
            assert!(warnings.is_empty());
        }
    }

    #[test]
    fn test_oversized_move_number_is_a_partial_game() {
        let pgn = "[Event \"Huge\"]\n99999999999999999999. e4\n1. d4 d5\n";
        let (results, warnings) = parse_collecting(pgn, false);

        assert_eq!(results.len(), 1);
        let game = results[0].as_ref().unwrap();
        assert_eq!(game.move_text(), "1. d4 d5");
        assert_eq!(game.tag_count(), 0);
        assert_eq!(
            warnings,
            vec![Warning::PartialGameSkipped {
                line: 2,
                move_number: "99999999999999999999".to_string(),
            }]
        );
        assert_eq!(
            warnings[0].to_string(),
            "2: skipping partial game starting at move 99999999999999999999"
        );
    }

    #[test]
    fn test_oversized_move_number_included_when_requested() {
        let (results, warnings) =
            parse_collecting("-99999999999999999999. e4\n18446744073709551617. d4\n", true);
        let move_texts: Vec<String> = results
            .into_iter()
            .map(|game| game.unwrap().move_text().to_string())
            .collect();
        assert_eq!(
            move_texts,
            vec!["-99999999999999999999. e4", "18446744073709551617. d4"]
        );
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_non_numeric_move_token_stays_fatal() {
        assert_eq!(starting_move("1a. e4", 6).unwrap_err().line(), 6);
        assert!(starting_move("-. e4", 1).is_err());
        assert!(matches!(
            starting_move("99999999999999999999x. e4", 1),
            Err(ParseError::UnexpectedLine { line: 1 })
        ));
        assert_eq!(starting_move("1. e4", 1).unwrap(), StartingMove::First);
        assert_eq!(
            starting_move("12... Nf6", 1).unwrap(),
            StartingMove::Later("12".to_string())
        );
    }

    #[test]
    fn test_accessors_expose_options_and_collected_warnings() {
        let options = ParseOptions {
            include_partial_games: true,
        };
        let mut parser = ArchiveParser::with_diagnostics(
            "[Event \"A\"]\n[Event \"B\"]\n[Site \"S\"]\n1. e4\n".as_bytes(),
            options,
            Vec::new(),
        );
        assert_eq!(parser.options(), options);
        assert!(parser.diagnostics().is_empty());

        let game = parser.next().unwrap().unwrap();
        let tags: Vec<(&str, &str)> = game.tags().collect();
        assert_eq!(tags, vec![("Event", "B"), ("Site", "S")]);
        assert_eq!(parser.diagnostics().len(), 1);
        assert_eq!(parser.diagnostics()[0].line(), 2);
    }

    #[test]
    fn test_move_number_token_is_trimmed_and_signed() {
        let (results, warnings) = parse_collecting(" 1 . e4\n+1. d4\n-3. c4\n", false);
        assert_eq!(results.len(), 2);
        assert_eq!(
            warnings,
            vec![Warning::PartialGameSkipped {
                line: 3,
                move_number: "-3".to_string(),
            }]
        );
    }

    #[test]
    fn test_line_numbers_count_blank_lines() {
        let pgn = "\n\n[Event \"x\"]\n\n[Event \"y\"]\n1. e4\n";
        let (_, warnings) = parse_collecting(pgn, false);
        assert_eq!(warnings[0].line(), 5);
    }

    #[test]
    fn test_consumer_can_stop_early() {
        let pgn = "[Event \"A\"]\n1. e4\n[Broken\n1. d4\n";
        let mut parser = ArchiveParser::from_text(pgn, ParseOptions::default());

        let first = parser.next().unwrap().unwrap();
        assert_eq!(first.tag("Event"), Some("A"));
        assert_eq!(parser.line_number(), 2);
        drop(parser);
    }

    struct FailingReader;

    impl Read for FailingReader {
        fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::other("disk on fire"))
        }
    }

    #[test]
    fn test_read_error_is_fatal() {
        let input = io::BufReader::new(FailingReader);
        let mut parser = ArchiveParser::with_diagnostics(
            input,
            ParseOptions::default(),
            crate::error::IgnoreDiagnostics,
        );

        match parser.next() {
            Some(Err(ParseError::Io { line, .. })) => assert_eq!(line, 1),
            other => panic!("expected Io error, got {other:?}"),
        }
        assert!(parser.next().is_none());
    }

    #[test]
    fn test_invalid_utf8_is_reported_as_io_error() {
        let bytes: &[u8] = b"1. e4\n[Event \"\xff\"]\n";
        let mut parser = ArchiveParser::with_diagnostics(
            bytes,
            ParseOptions::default(),
            crate::error::IgnoreDiagnostics,
        );

        assert!(parser.next().unwrap().is_ok());
        assert!(matches!(
            parser.next(),
            Some(Err(ParseError::Io { line: 2, .. }))
        ));
    }

    #[test]
    fn test_parser_is_send_for_owned_inputs() {
        fn assert_send<T: Send>() {}
        assert_send::<ArchiveParser<io::BufReader<std::fs::File>, Vec<Warning>>>();
    }
}
