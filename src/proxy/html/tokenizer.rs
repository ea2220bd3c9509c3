//! Streaming HTML tokenizer
//!
//! A forward-only push tokenizer: bytes go in chunk by chunk, a closed set of
//! token variants comes out. Only the current unfinished token is buffered
//! across chunk boundaries, so memory stays bounded no matter how large the
//! document is; a single token larger than [`MAX_TOKEN_BYTES`] is treated as
//! a parse error rather than an excuse to buffer without limit.
//!
//! The tokenizer is deliberately lenient the way browsers are: a stray `<`
//! in text stays text, unknown entities pass through literally, and whatever
//! is left unterminated when the document ends is flushed as text.

use bytes::Bytes;
use thiserror::Error;

/// Upper bound on a single markup token (tag, comment, declaration)
pub const MAX_TOKEN_BYTES: usize = 64 * 1024;

/// One markup token
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// An open tag with its attributes in encountered order. Names are
    /// ASCII-lowercased, attribute values entity-decoded.
    Open {
        name: String,
        attrs: Vec<(String, String)>,
    },
    /// A close tag (`</name>`), name lowercased
    Close(String),
    /// Verbatim character data
    Text(Bytes),
    /// Comment contents (without the `<!--` `-->` markers)
    Comment(String),
    /// A processing instruction or declaration: everything between `<` and
    /// `>`, e.g. `?xml version="1.0"?` or `!DOCTYPE html`. `name` is the
    /// lowercased first word.
    Pi { name: String, data: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenizeError {
    #[error("markup token exceeds {MAX_TOKEN_BYTES} bytes")]
    TokenTooLong,
}

/// Elements whose raw contents are never parsed as markup
const RAWTEXT_ELEMENTS: [&str; 2] = ["script", "style"];

#[derive(Default)]
pub struct Tokenizer {
    pending: Vec<u8>,
    /// Set while inside `<script>`/`<style>`: contents are text until the
    /// matching close tag
    raw_text: Option<String>,
}

impl Tokenizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, appending completed tokens to `out`.
    pub fn push(&mut self, input: &[u8], out: &mut Vec<Token>) -> Result<(), TokenizeError> {
        self.pending.extend_from_slice(input);
        self.process(out)
    }

    /// Signal end of input, flushing any unterminated remainder as text.
    pub fn finish(&mut self, out: &mut Vec<Token>) {
        if !self.pending.is_empty() {
            out.push(Token::Text(Bytes::from(std::mem::take(&mut self.pending))));
        }
    }

    fn process(&mut self, out: &mut Vec<Token>) -> Result<(), TokenizeError> {
        let mut pos = 0;
        loop {
            if let Some(elem) = self.raw_text.clone() {
                match find_rawtext_close(&self.pending[pos..], &elem) {
                    Some(idx) => {
                        emit_text(out, &self.pending[pos..pos + idx]);
                        pos += idx;
                        self.raw_text = None;
                        // fall through: the close tag parses normally
                    }
                    None => {
                        // hold back only as much as a split close tag could span
                        let keep = elem.len() + 2;
                        let emit_to = self.pending.len().saturating_sub(keep).max(pos);
                        emit_text(out, &self.pending[pos..emit_to]);
                        pos = emit_to;
                        break;
                    }
                }
            }

            let Some(lt) = find_byte(&self.pending[pos..], b'<') else {
                emit_text(out, &self.pending[pos..]);
                pos = self.pending.len();
                break;
            };
            emit_text(out, &self.pending[pos..pos + lt]);
            pos += lt;

            // pos is at '<'; classify by the next byte
            if pos + 1 >= self.pending.len() {
                break;
            }
            match self.pending[pos + 1] {
                b'!' => {
                    if self.pending.len() - pos < 4 {
                        break;
                    }
                    if self.pending[pos..pos + 4] == *b"<!--" {
                        match find_subslice(&self.pending[pos + 4..], b"-->") {
                            Some(end) => {
                                let text = &self.pending[pos + 4..pos + 4 + end];
                                out.push(Token::Comment(
                                    String::from_utf8_lossy(text).into_owned(),
                                ));
                                pos += 4 + end + 3;
                            }
                            None => break,
                        }
                    } else {
                        match find_byte(&self.pending[pos + 2..], b'>') {
                            Some(gt) => {
                                out.push(pi_token(&self.pending[pos + 1..pos + 2 + gt]));
                                pos += 2 + gt + 1;
                            }
                            None => break,
                        }
                    }
                }
                b'?' => match find_byte(&self.pending[pos + 2..], b'>') {
                    Some(gt) => {
                        out.push(pi_token(&self.pending[pos + 1..pos + 2 + gt]));
                        pos += 2 + gt + 1;
                    }
                    None => break,
                },
                b'/' => match find_byte(&self.pending[pos + 2..], b'>') {
                    Some(gt) => {
                        let name = close_tag_name(&self.pending[pos + 2..pos + 2 + gt]);
                        if !name.is_empty() {
                            out.push(Token::Close(name));
                        }
                        pos += 2 + gt + 1;
                    }
                    None => break,
                },
                c if c.is_ascii_alphabetic() => match find_tag_end(&self.pending[pos..]) {
                    Some(gt) => {
                        let (token, self_closing) =
                            parse_open_tag(&self.pending[pos + 1..pos + gt]);
                        if let Token::Open { name, .. } = &token {
                            if !self_closing && RAWTEXT_ELEMENTS.contains(&name.as_str()) {
                                self.raw_text = Some(name.clone());
                            }
                        }
                        out.push(token);
                        pos += gt + 1;
                    }
                    None => break,
                },
                _ => {
                    // a lone '<' is character data
                    emit_text(out, b"<");
                    pos += 1;
                }
            }
        }

        self.pending.drain(..pos);
        if self.pending.len() > MAX_TOKEN_BYTES {
            return Err(TokenizeError::TokenTooLong);
        }
        Ok(())
    }
}

fn emit_text(out: &mut Vec<Token>, text: &[u8]) {
    if !text.is_empty() {
        out.push(Token::Text(Bytes::copy_from_slice(text)));
    }
}

fn find_byte(haystack: &[u8], byte: u8) -> Option<usize> {
    haystack.iter().position(|&b| b == byte)
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Find `</name` (case-insensitive) in `haystack`
fn find_rawtext_close(haystack: &[u8], name: &str) -> Option<usize> {
    let needle_len = name.len() + 2;
    if haystack.len() < needle_len {
        return None;
    }
    (0..=haystack.len() - needle_len).find(|&i| {
        haystack[i] == b'<'
            && haystack[i + 1] == b'/'
            && haystack[i + 2..i + needle_len].eq_ignore_ascii_case(name.as_bytes())
    })
}

/// Find the `>` ending an open tag, ignoring `>` inside quoted attribute
/// values. `haystack[0]` is the `<`. Quotes only delimit when they directly
/// follow `=`, so apostrophes inside unquoted values stay harmless.
fn find_tag_end(haystack: &[u8]) -> Option<usize> {
    enum State {
        Default,
        AfterEq,
        Quoted(u8),
        Unquoted,
    }
    let mut state = State::Default;
    for (i, &b) in haystack.iter().enumerate().skip(1) {
        state = match state {
            State::Default => match b {
                b'=' => State::AfterEq,
                b'>' => return Some(i),
                _ => State::Default,
            },
            State::AfterEq => match b {
                b'"' | b'\'' => State::Quoted(b),
                b'>' => return Some(i),
                b if b.is_ascii_whitespace() => State::AfterEq,
                _ => State::Unquoted,
            },
            State::Quoted(q) => {
                if b == q {
                    State::Default
                } else {
                    State::Quoted(q)
                }
            }
            State::Unquoted => match b {
                b'>' => return Some(i),
                b if b.is_ascii_whitespace() => State::Default,
                _ => State::Unquoted,
            },
        };
    }
    None
}

fn close_tag_name(content: &[u8]) -> String {
    let end = content
        .iter()
        .position(|&b| b.is_ascii_whitespace() || b == b'/')
        .unwrap_or(content.len());
    String::from_utf8_lossy(&content[..end]).to_ascii_lowercase()
}

fn pi_token(data: &[u8]) -> Token {
    let data = String::from_utf8_lossy(data).into_owned();
    let name = data
        .split_ascii_whitespace()
        .next()
        .unwrap_or("")
        .to_ascii_lowercase();
    Token::Pi { name, data }
}

/// Parse the contents of an open tag (between `<` and `>`). Returns the
/// token and whether the tag was self-closing.
fn parse_open_tag(content: &[u8]) -> (Token, bool) {
    let self_closing = content.last() == Some(&b'/');
    let len = content.len();
    let mut i = 0;

    while i < len && !content[i].is_ascii_whitespace() && content[i] != b'/' {
        i += 1;
    }
    let name = String::from_utf8_lossy(&content[..i]).to_ascii_lowercase();

    let mut attrs: Vec<(String, String)> = Vec::new();
    loop {
        while i < len && (content[i].is_ascii_whitespace() || content[i] == b'/') {
            i += 1;
        }
        if i >= len {
            break;
        }
        let start = i;
        while i < len
            && !content[i].is_ascii_whitespace()
            && content[i] != b'='
            && content[i] != b'/'
        {
            i += 1;
        }
        let attr_name = String::from_utf8_lossy(&content[start..i]).to_ascii_lowercase();
        while i < len && content[i].is_ascii_whitespace() {
            i += 1;
        }
        let mut value = String::new();
        if i < len && content[i] == b'=' {
            i += 1;
            while i < len && content[i].is_ascii_whitespace() {
                i += 1;
            }
            if i < len && (content[i] == b'"' || content[i] == b'\'') {
                let quote = content[i];
                i += 1;
                let start = i;
                while i < len && content[i] != quote {
                    i += 1;
                }
                value = decode_entities(&content[start..i]);
                if i < len {
                    i += 1;
                }
            } else {
                let start = i;
                while i < len && !content[i].is_ascii_whitespace() {
                    i += 1;
                }
                value = decode_entities(&content[start..i]);
            }
        }
        // first occurrence of a duplicated attribute wins
        if !attr_name.is_empty() && !attrs.iter().any(|(n, _)| *n == attr_name) {
            attrs.push((attr_name, value));
        }
    }

    (Token::Open { name, attrs }, self_closing)
}

/// Decode named basics and numeric character references; anything unknown
/// passes through literally.
fn decode_entities(raw: &[u8]) -> String {
    let s = String::from_utf8_lossy(raw);
    if !s.contains('&') {
        return s.into_owned();
    }
    let mut out = String::with_capacity(s.len());
    let mut rest: &str = &s;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp..];
        let semicolon = tail[1..].char_indices().take(32).find(|(_, c)| *c == ';');
        match semicolon.and_then(|(idx, _)| decode_entity(&tail[1..1 + idx]).map(|c| (idx, c))) {
            Some((idx, decoded)) => {
                out.push(decoded);
                rest = &tail[idx + 2..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn decode_entity(name: &str) -> Option<char> {
    Some(match name {
        "amp" => '&',
        "lt" => '<',
        "gt" => '>',
        "quot" => '"',
        "apos" => '\'',
        "nbsp" => '\u{a0}',
        _ => {
            let num = name.strip_prefix('#')?;
            let code = match num.strip_prefix(['x', 'X']) {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => num.parse::<u32>().ok()?,
            };
            return char::from_u32(code);
        }
    })
}
