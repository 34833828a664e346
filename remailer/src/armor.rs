//! ASCII armor shared by reply blocks, keyrings and encrypted messages

use base64::{engine::general_purpose::STANDARD, Engine};

use crate::MixResult;

/// Base64 line width
const LINE_WIDTH: usize = 64;

/// Base64 with line breaks every 64 characters, no trailing newline
pub fn encode(data: &[u8]) -> String {
    let encoded = STANDARD.encode(data);
    encoded
        .as_bytes()
        .chunks(LINE_WIDTH)
        .map(|line| String::from_utf8_lossy(line).into_owned())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Decode Base64 spread over lines; whitespace is ignored
pub fn decode<'a>(lines: impl IntoIterator<Item = &'a str>) -> MixResult<Vec<u8>> {
    let joined: String = lines
        .into_iter()
        .flat_map(|l| l.chars().filter(|c| !c.is_whitespace()))
        .collect();
    Ok(STANDARD.decode(joined)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_wrapped() {
        let text = encode(&[0xA5; 200]);
        assert!(text.lines().all(|l| l.len() <= LINE_WIDTH));
        assert_eq!(decode(text.lines()).unwrap(), vec![0xA5; 200]);
    }

    #[test]
    fn test_bad_base64() {
        assert!(decode(["not base64!"]).unwrap_err().is_parse_error());
    }
}
