// crates/reelkit-core/src/path.rs
//
// SeqPath: a media locator that understands numbered image sequences.
// "render/Shot01.0012.ppm" splits into directory, base name, frame field,
// and extension; `get(Some(frame))` produces per-frame file names with the
// original zero padding.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SeqPath {
    directory: String,
    base:      String,
    number:    Option<i64>,
    pad:       usize,
    extension: String,
}

impl SeqPath {
    /// Split `s` into parts. The frame field is the run of trailing digits
    /// in the file stem; a stem without one is a plain (non-sequence) path.
    /// Padding is remembered only when the field has leading zeros, so
    /// `file.0100.ppm` pads to four digits but `file.100.ppm` does not.
    pub fn parse(s: &str) -> SeqPath {
        let (directory, file) = match s.rfind('/') {
            Some(i) => (s[..=i].to_string(), &s[i + 1..]),
            None    => (String::new(), s),
        };
        let (stem, extension) = match file.rfind('.') {
            Some(i) if i > 0 => (&file[..i], file[i..].to_string()),
            _                => (file, String::new()),
        };
        let digits = stem
            .chars()
            .rev()
            .take_while(|c| c.is_ascii_digit())
            .count();
        if digits == 0 {
            return SeqPath {
                directory,
                base: stem.to_string(),
                number: None,
                pad: 0,
                extension,
            };
        }
        let split = stem.len() - digits;
        let field = &stem[split..];
        SeqPath {
            directory,
            base:      stem[..split].to_string(),
            number:    field.parse::<i64>().ok(),
            pad:       if field.starts_with('0') && field.len() > 1 {
                field.len()
            } else {
                0
            },
            extension,
        }
    }

    /// File name for `frame`, or the path as parsed when `frame` is `None`.
    pub fn get(&self, frame: Option<i64>) -> String {
        let frame = frame.or(self.number);
        match frame {
            Some(f) => format!(
                "{}{}{:0pad$}{}",
                self.directory,
                self.base,
                f,
                self.extension,
                pad = self.pad,
            ),
            None => format!("{}{}{}", self.directory, self.base, self.extension),
        }
    }

    /// The path as given to `parse`. Used as the reader identity key: every
    /// frame of a sequence shares one reader.
    pub fn full(&self) -> String {
        self.get(None)
    }

    /// Lower-cased extension without the leading dot.
    pub fn extension(&self) -> String {
        self.extension.trim_start_matches('.').to_lowercase()
    }

    pub fn directory(&self) -> &str {
        &self.directory
    }

    pub fn base_name(&self) -> &str {
        &self.base
    }

    pub fn is_sequence(&self) -> bool {
        self.number.is_some()
    }

    pub fn start_frame(&self) -> Option<i64> {
        self.number
    }

    pub fn is_empty(&self) -> bool {
        self.directory.is_empty() && self.base.is_empty() && self.extension.is_empty()
    }
}

impl fmt::Display for SeqPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full())
    }
}
