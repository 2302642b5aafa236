use crate::error::{MalformedTagReason, ParseError};

/// Parse a single `[Key "Value"]` tag line.
///
/// Only one tag per line is accepted. The key is trimmed; the value is the text
/// between the first and last `"` on the line, without escape processing.
pub fn parse_tag_line(line: &str, line_number: usize) -> Result<(String, String), ParseError> {
    let malformed = |reason| ParseError::MalformedTag {
        line: line_number,
        reason,
    };

    let line = line.trim();
    if !line.starts_with('[') {
        return Err(malformed(MalformedTagReason::MissingOpeningBracket));
    }

    let close_bracket = line
        .find(']')
        .ok_or(malformed(MalformedTagReason::MissingClosingBracket))?;

    if line[close_bracket..].contains('[') {
        return Err(malformed(MalformedTagReason::MultipleTags));
    }

    let (open_quote, close_quote) = match (line.find('"'), line.rfind('"')) {
        (Some(open), Some(close)) if open < close && close < close_bracket => (open, close),
        _ => return Err(malformed(MalformedTagReason::MalformedQuotes)),
    };

    let key = line[1..open_quote].trim().to_string();
    let value = line[open_quote + 1..close_quote].to_string();

    Ok((key, value))
}
