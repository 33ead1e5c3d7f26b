//! Operator console and per-host line prefixing

use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};

/// ANSI colors assigned to hosts by their position in the network
pub const PALETTE: &[&str] = &[
    "\x1b[32m", // green
    "\x1b[33m", // yellow
    "\x1b[36m", // cyan
    "\x1b[35m", // magenta
    "\x1b[31m", // red
    "\x1b[34m", // blue
];

pub const RESET: &str = "\x1b[0m";

/// Color for the host at `index` in the network's host list
pub fn color_for(index: usize) -> &'static str {
    PALETTE[index % PALETTE.len()]
}

/// Host label written in front of every output line.
///
/// `width` is the visible length; color escapes do not count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prefix {
    pub label: String,
    pub width: usize,
}

impl Prefix {
    pub fn new(text: &str, color: Option<&str>) -> Self {
        let label = match color {
            Some(color) => format!("{}{}{}", color, text, RESET),
            None => text.to_string(),
        };
        Self {
            label,
            width: text.chars().count(),
        }
    }

    /// Label left-padded so that every prefix ends at `max_width`
    pub fn aligned(&self, max_width: usize) -> String {
        let padding = max_width.saturating_sub(self.width);
        format!("{}{}", " ".repeat(padding), self.label)
    }
}

/// Widest visible prefix
pub fn max_width<'a, I>(prefixes: I) -> usize
where
    I: IntoIterator<Item = &'a Prefix>,
{
    prefixes.into_iter().map(|p| p.width).max().unwrap_or(0)
}

type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;

/// Which console stream a copy targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// The operator's stdout/stderr, shared by every copy loop.
///
/// Each write happens under the stream's lock, so chunks from different
/// hosts never interleave within one write.
#[derive(Clone)]
pub struct Console {
    stdout: SharedWriter,
    stderr: SharedWriter,
}

impl Console {
    pub fn new<O, E>(stdout: O, stderr: E) -> Self
    where
        O: Write + Send + 'static,
        E: Write + Send + 'static,
    {
        Self {
            stdout: Arc::new(Mutex::new(Box::new(stdout))),
            stderr: Arc::new(Mutex::new(Box::new(stderr))),
        }
    }

    /// Console bound to the process's own stdout and stderr
    pub fn stdio() -> Self {
        Self::new(io::stdout(), io::stderr())
    }

    pub fn write(&self, stream: Stream, bytes: &[u8]) -> io::Result<()> {
        let target = match stream {
            Stream::Stdout => &self.stdout,
            Stream::Stderr => &self.stderr,
        };
        let mut writer = target.lock().unwrap_or_else(|e| e.into_inner());
        writer.write_all(bytes)?;
        writer.flush()
    }

    /// Print an operator-facing error line. Console failures are dropped.
    pub fn error_line(&self, prefix: &str, message: impl std::fmt::Display) {
        let line = format!("{}{}\n", prefix, message);
        let _ = self.write(Stream::Stderr, line.as_bytes());
    }
}

/// Inserts a prefix at the start of every line of a byte stream.
pub struct Prefixer {
    prefix: Vec<u8>,
    at_line_start: bool,
}

impl Prefixer {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.as_bytes().to_vec(),
            at_line_start: true,
        }
    }

    /// Prefix one chunk. Partial lines carry over to the next chunk.
    pub fn apply(&mut self, chunk: &[u8]) -> Vec<u8> {
        if self.prefix.is_empty() {
            return chunk.to_vec();
        }
        let mut out = Vec::with_capacity(chunk.len() + self.prefix.len());
        for line in chunk.split_inclusive(|b| *b == b'\n') {
            if self.at_line_start {
                out.extend_from_slice(&self.prefix);
            }
            out.extend_from_slice(line);
            self.at_line_start = line.ends_with(b"\n");
        }
        out
    }
}

/// Copy `reader` to the console, prefixing each line.
///
/// Returns the number of bytes read from `reader`.
pub fn copy_prefixed<R: Read>(
    mut reader: R,
    console: &Console,
    stream: Stream,
    prefix: &str,
) -> io::Result<u64> {
    let mut prefixer = Prefixer::new(prefix);
    let mut buf = [0u8; 8192];
    let mut total = 0u64;

    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        console.write(stream, &prefixer.apply(&buf[..n]))?;
        total += n as u64;
    }

    Ok(total)
}

/// Cloneable in-memory sink, handy for capturing console output.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.contents()).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_alignment() {
        let prefixes = [
            Prefix::new("abc", None),
            Prefix::new("abcdefg", None),
            Prefix::new("abcde", None),
        ];
        let max = max_width(&prefixes);
        assert_eq!(max, 7);
        assert_eq!(prefixes[0].aligned(max), "    abc");
        assert_eq!(prefixes[1].aligned(max), "abcdefg");
        assert_eq!(prefixes[2].aligned(max), "  abcde");
    }

    #[test]
    fn test_colored_prefix_width_ignores_escapes() {
        let prefix = Prefix::new("deploy@web1:22 | ", Some(color_for(0)));
        assert_eq!(prefix.width, 17);
        assert!(prefix.label.starts_with("\x1b[32m"));
        assert!(prefix.label.ends_with(RESET));
        assert_eq!(prefix.aligned(20), format!("   {}", prefix.label));
    }

    #[test]
    fn test_palette_rotates() {
        assert_eq!(color_for(0), color_for(PALETTE.len()));
        assert_ne!(color_for(0), color_for(1));
    }

    #[test]
    fn test_prefixer_handles_partial_lines() {
        let mut prefixer = Prefixer::new("> ");
        assert_eq!(prefixer.apply(b"one\ntw"), b"> one\n> tw".to_vec());
        assert_eq!(prefixer.apply(b"o\nthree\n"), b"o\n> three\n".to_vec());
        assert_eq!(prefixer.apply(b"\n"), b"> \n".to_vec());
    }

    #[test]
    fn test_prefixer_without_prefix_is_passthrough() {
        let mut prefixer = Prefixer::new("");
        assert_eq!(prefixer.apply(b"a\nb"), b"a\nb".to_vec());
    }

    #[test]
    fn test_copy_prefixed_to_console() {
        let out = SharedBuffer::new();
        let err = SharedBuffer::new();
        let console = Console::new(out.clone(), err.clone());

        let n = copy_prefixed(&b"hi\nthere"[..], &console, Stream::Stdout, "h1 | ").unwrap();
        assert_eq!(n, 8);
        assert_eq!(out.to_string_lossy(), "h1 | hi\nh1 | there");
        assert!(err.contents().is_empty());

        console.error_line("h1 | ", "boom");
        assert_eq!(err.to_string_lossy(), "h1 | boom\n");
    }
}
