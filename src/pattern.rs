use super::PatchError;
use super::Result;

use log::debug;
use log::trace;
use regex::bytes::Regex;

/*
    Pattern tokens:
      ? / ?? => any byte
      _      => exact byte, two hex digits
*/

/// PatternByte is one position of a signature:
///    * `Exact(u8)` => The byte analyzed has to match the given one
///    * `Any` => The byte analyzed always matches
///
/// Example
/// ```rust
///    use sigpatch::pattern::PatternByte;
///    let any = PatternByte::parse("??").unwrap();
///    let exact = PatternByte::parse("2F").unwrap();
///    assert_eq!(exact, PatternByte::Exact(0x2F));
///    assert_eq!(any, PatternByte::Any);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PatternByte {
    Exact(u8),
    Any,
}
impl PatternByte {
    /// parse returns the PatternByte for one whitespace-free token
    pub fn parse(token: &str) -> Result<Self> {
        trace!("Create a pattern byte from {token}");
        use PatternByte::*;
        let byte = match token {
            "?" | "??" => Any,
            _ if token.len() == 2 => Exact(hex::decode(token)?[0]),
            _ => {
                return Err(PatchError::PatternError(format!(
                    "`{token}` is not a two-digit hex byte"
                )))
            }
        };
        Ok(byte)
    }
}
impl std::fmt::Display for PatternByte {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use PatternByte::*;
        match self {
            Any => write!(f, "??"),
            Exact(byte) => write!(f, "{:02X}", byte),
        }
    }
}

/// Pattern is a parsed signature, used to locate a byte sequence inside a memory range.
///
/// Example
/// ```rust
/// use sigpatch::pattern::Pattern;
/// let pattern = Pattern::new("55 48 89 E5 ?? ?? 41").unwrap();
/// let code = [0xCCu8, 0x55, 0x48, 0x89, 0xE5, 0x10, 0x20, 0x41];
/// assert_eq!(pattern.find_in(&code), Some(1));
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pattern {
    pub bytes: Vec<PatternByte>,
}
impl Pattern {
    pub fn new(pattern: &str) -> Result<Self> {
        trace!("Create a new pattern structure");
        let bytes = pattern
            .split_whitespace()
            .map(PatternByte::parse)
            .collect::<Result<Vec<PatternByte>>>()?;
        if bytes.is_empty() {
            return Err(PatchError::PatternError("empty pattern".into()));
        }
        Ok(Pattern { bytes })
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn build_regexp(&self) -> Result<Regex> {
        let mut regexp = self
            .bytes
            .iter()
            .map(|x| match x {
                PatternByte::Any => ".".to_string(),
                PatternByte::Exact(byte) => format!("\\x{:02x}", byte),
            })
            .collect::<Vec<_>>()
            .join("");
        debug!("{}", regexp);
        regexp.insert_str(0, "(?s-u)");
        Ok(Regex::new(&regexp)?)
    }

    /// Offset of the first match inside `data`.
    pub fn find_in(&self, data: &[u8]) -> Option<usize> {
        match self.build_regexp() {
            Ok(regexp) => regexp.find(data).map(|found| found.start()),
            Err(err) => {
                debug!("Pattern {} did not compile: {}", self, err);
                None
            }
        }
    }

    /// Scans `size` bytes starting at `base` and returns the address of the first match.
    ///
    /// # Safety
    /// `[base, base + size)` must be mapped and readable for the whole scan.
    pub unsafe fn find(&self, base: usize, size: usize) -> Result<usize> {
        trace!("Trying to find address for pattern {} in {:#x}+{:#x}", self, base, size);
        if base == 0 {
            return Err(PatchError::NullAddress);
        }
        let regexp = self.build_regexp()?;
        let data = std::slice::from_raw_parts::<u8>(base as *const _, size);
        match regexp.find(data) {
            None => Err(PatchError::PatternError(format!("no match for `{}`", self))),
            Some(found) => Ok(found.start() + base),
        }
    }
}

impl std::fmt::Display for Pattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tokens: Vec<String> = self.bytes.iter().map(|b| b.to_string()).collect();
        write!(f, "{}", tokens.join(" "))
    }
}
