//! Reading the end of a server log.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

const CHUNK: u64 = 8 * 1024;

/// The last `lines` lines of the file at `path`, newline-terminated.
///
/// Only the tail of the file is read. Bytes that are not UTF-8 (query text
/// in another encoding, LATIN1 server messages) are replaced, not rejected.
pub fn read_tail(path: &Path, lines: usize) -> io::Result<String> {
    if lines == 0 {
        return Ok(String::new());
    }
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();

    let mut start = len;
    let mut buf: Vec<u8> = Vec::new();
    while start > 0 {
        let step = CHUNK.min(start);
        start -= step;
        file.seek(SeekFrom::Start(start))?;
        let mut chunk = vec![0; step as usize];
        file.read_exact(&mut chunk)?;
        chunk.extend_from_slice(&buf);
        buf = chunk;

        let body = buf.strip_suffix(b"\n").unwrap_or(&buf[..]);
        if newlines(body) >= lines {
            break;
        }
    }

    let body = buf.strip_suffix(b"\n").unwrap_or(&buf[..]);
    let mut from = 0;
    let mut seen = 0;
    for (i, b) in body.iter().enumerate().rev() {
        if *b == b'\n' {
            seen += 1;
            if seen == lines {
                from = i + 1;
                break;
            }
        }
    }
    if body.is_empty() {
        return Ok(String::new());
    }
    let mut out = String::from_utf8_lossy(&body[from..]).into_owned();
    out.push('\n');
    Ok(out)
}

fn newlines(bytes: &[u8]) -> usize {
    bytes.iter().filter(|b| **b == b'\n').count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn log_with(content: &[u8]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content).unwrap();
        f
    }

    #[test]
    fn returns_last_lines() {
        let f = log_with(b"one\ntwo\nthree\n");
        assert_eq!(read_tail(f.path(), 2).unwrap(), "two\nthree\n");
        assert_eq!(read_tail(f.path(), 10).unwrap(), "one\ntwo\nthree\n");
        assert_eq!(read_tail(f.path(), 0).unwrap(), "");
    }

    #[test]
    fn missing_trailing_newline() {
        let f = log_with(b"one\ntwo");
        assert_eq!(read_tail(f.path(), 1).unwrap(), "two\n");
    }

    #[test]
    fn empty_file() {
        let f = log_with(b"");
        assert_eq!(read_tail(f.path(), 5).unwrap(), "");
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        let f = log_with(b"LOG:  ok\nSTATEMENT:  SELECT '\xe9t\xe9'\n");
        let tail = read_tail(f.path(), 1).unwrap();
        assert!(tail.starts_with("STATEMENT:  SELECT '"));
        assert!(tail.contains('\u{FFFD}'));
    }

    #[test]
    fn spans_several_chunks() {
        let mut content = Vec::new();
        for i in 0..5000 {
            content.extend_from_slice(format!("LOG:  line {i}\n").as_bytes());
        }
        let f = log_with(&content);
        let tail = read_tail(f.path(), 3).unwrap();
        assert_eq!(tail, "LOG:  line 4997\nLOG:  line 4998\nLOG:  line 4999\n");
        let many = read_tail(f.path(), 2000).unwrap();
        assert_eq!(many.lines().count(), 2000);
        assert!(many.starts_with("LOG:  line 3000\n"));
    }
}
