use std::fs::File;
use std::path::Path;
use std::rc::Rc;

use memmap2::Mmap;

use crate::errors::ErrorHandler;
use crate::lex::Position;

/// Random-access view over one translation input: a file or an in-memory
/// buffer. Tracks the cursor and line/column as it is consumed.
///
/// Files are acquired by read-only memory mapping where possible, falling
/// back to reading the whole file into an owned buffer. The `Data` tag
/// records which path was taken so release (drop) uses the matching
/// primitive; aliased buffers are never freed.
pub struct Reader<'s> {
    pub name: Rc<str>,
    data: Data<'s>,

    pub pos: usize,
    /// Current line, 1-based.
    pub lnum: usize,
    /// Offset of the first byte of the current line.
    pub lpos: usize,

    validated_pos: usize,
    validated_lnum: usize,
    validated_lpos: usize,
}

enum Data<'s> {
    Mapped(Mmap),
    Owned(Box<[u8]>),
    Alias(&'s [u8]),
}

impl<'s> Reader<'s> {
    /// Open a file, preferring a read-only mapping. `None` means not found or
    /// unreadable; opening never panics and never raises a diagnostic itself.
    pub fn open(path: &Path) -> Option<Reader<'static>> {
        let file = File::open(path).ok()?;
        let data = match unsafe { Mmap::map(&file) } {
            Ok(map) if !map.is_empty() => Data::Mapped(map),
            _ => Data::Owned(std::fs::read(path).ok()?.into_boxed_slice()),
        };
        Some(Reader::with_data(Rc::from(path.to_string_lossy().as_ref()), data))
    }

    /// View a string as a source. `copy` duplicates the contents into an
    /// owned buffer; otherwise the reader aliases the caller's storage.
    pub fn from_string(name: &str, contents: &'s str, copy: bool) -> Reader<'s> {
        let data = if copy {
            Data::Owned(contents.as_bytes().to_vec().into_boxed_slice())
        } else {
            Data::Alias(contents.as_bytes())
        };
        Reader::with_data(Rc::from(name), data)
    }

    /// View a borrowed byte slice as a source. Never frees.
    pub fn alias(name: &str, contents: &'s [u8]) -> Reader<'s> {
        Reader::with_data(Rc::from(name), Data::Alias(contents))
    }

    fn with_data(name: Rc<str>, data: Data<'s>) -> Reader<'s> {
        Reader {
            name,
            data,
            pos: 0,
            lnum: 1,
            lpos: 0,
            validated_pos: 0,
            validated_lnum: 1,
            validated_lpos: 0,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        match self.data {
            Data::Mapped(ref map) => &map[..],
            Data::Owned(ref buf) => &buf[..],
            Data::Alias(buf) => buf,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    pub fn eof(&self) -> bool {
        self.pos >= self.len()
    }

    pub fn tell(&self) -> usize {
        self.pos
    }

    /// Byte at an absolute offset; reads past the end yield `\0`, a sentinel
    /// that is neither a letter nor a digit.
    pub fn byte_at(&self, offset: usize) -> u8 {
        self.bytes().get(offset).copied().unwrap_or(0)
    }

    /// Byte at the cursor.
    pub fn at(&self) -> u8 {
        self.byte_at(self.pos)
    }

    /// Byte just after the cursor.
    pub fn peek_next(&self) -> u8 {
        self.byte_at(self.pos + 1)
    }

    /// Move the cursor forward one byte. Returns false at end; advancing past
    /// the end is idempotent.
    pub fn advance(&mut self) -> bool {
        if self.pos < self.len() {
            self.pos += 1;
        }
        self.pos < self.len()
    }

    /// Advance, then return the byte now at the cursor.
    pub fn next(&mut self) -> u8 {
        self.advance();
        self.at()
    }

    /// Return the byte at the cursor, then advance.
    pub fn getc(&mut self) -> u8 {
        let b = self.at();
        self.advance();
        b
    }

    pub fn skip(&mut self, n: usize) -> bool {
        self.pos = usize::min(self.pos + n, self.len());
        self.pos < self.len()
    }

    /// Consume one byte if it matches.
    pub fn take(&mut self, expected: u8) -> bool {
        if self.at() == expected {
            self.advance();
            return true;
        }
        false
    }

    /// Consume a byte string if the input continues with it.
    pub fn take_str(&mut self, expected: &[u8]) -> bool {
        if self.bytes()[self.pos..].starts_with(expected) {
            self.pos += expected.len();
            return true;
        }
        false
    }

    pub fn slice(&self, begin: usize) -> &[u8] {
        &self.bytes()[begin..self.pos]
    }

    pub fn slice_to(&self, begin: usize, end: usize) -> &[u8] {
        &self.bytes()[begin..end]
    }

    pub fn at_newline(&self) -> bool {
        matches!(self.at(), b'\n' | b'\r')
    }

    /// Consume `\n`, `\r`, or `\r\n` as exactly one newline, bumping the line
    /// counter and resetting the line base. No-op when not at a newline.
    pub fn take_newline(&mut self) {
        match self.at() {
            b'\n' => {
                self.advance();
            }
            b'\r' => {
                self.advance();
                self.take(b'\n');
            }
            _ => return,
        }
        self.lnum += 1;
        self.lpos = self.pos;
    }

    /// Skip spaces and tabs only; newlines are significant to callers.
    pub fn skip_whitespace(&mut self) {
        while let b' ' | b'\t' = self.at() {
            if !self.advance() {
                break;
            }
        }
    }

    pub fn position(&self) -> Position {
        self.position_at(self.pos)
    }

    pub fn position_at(&self, offset: usize) -> Position {
        Position {
            file: self.name.clone(),
            line: self.lnum,
            col: offset.saturating_sub(self.lpos),
            offset,
        }
    }

    /// Recount newlines over the consumed region and cross-check the line
    /// bookkeeping. The validated cursor never moves backward; a backward
    /// jump or a line desync is an internal error, reported and repaired.
    pub fn validate(&mut self, herr: &dyn ErrorHandler) {
        if self.pos >= self.len() {
            return;
        }
        if self.pos < self.validated_pos {
            herr.error_at(&self.position(), "internal error: someone rewound the reader");
            self.validated_pos = 0;
            self.validated_lnum = 1;
            self.validated_lpos = 0;
        }
        while self.validated_pos < self.pos {
            let b = self.byte_at(self.validated_pos);
            if b == b'\n' || (b == b'\r' && self.byte_at(self.validated_pos + 1) != b'\n') {
                self.validated_lnum += 1;
                self.validated_lpos = self.validated_pos + 1;
            }
            self.validated_pos += 1;
        }
        if self.lnum != self.validated_lnum || self.lpos != self.validated_lpos {
            herr.error_at(
                &self.position(),
                &format!(
                    "internal error: reader believes it is at line {}, \
                     but a recount puts it at line {}",
                    self.lnum, self.validated_lnum
                ),
            );
            self.lnum = self.validated_lnum;
            self.lpos = self.validated_lpos;
        }
    }
}
