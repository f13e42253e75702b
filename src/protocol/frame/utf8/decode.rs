// Incremental UTF-8 boundary handling in the spirit of
// https://github.com/SimonSapin/rust-utf8, rebuilt on top of simdutf8.

use std::str;

/// Carries at most one partial UTF-8 code point across fragment boundaries.
#[derive(Debug, Copy, Clone, Default)]
pub(crate) struct Incomplete {
    buf: [u8; 4],
    len: u8,
}

impl Incomplete {
    /// Stores the trailing bytes of a chunk that end mid code point.
    ///
    /// `bytes` must be shorter than four bytes; longer inputs cannot be a
    /// single partial code point.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut buf = [0; 4];
        buf[..bytes.len()].copy_from_slice(bytes);
        Self {
            buf,
            len: bytes.len() as u8,
        }
    }

    /// Returns the number of carried bytes.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Checks whether anything is carried over.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Tries to finish the carried code point with bytes from `input`.
    ///
    /// * `None`: still incomplete, call again with more input. If no more
    ///   input exists the carried bytes are an invalid sequence.
    /// * `Some((Ok(text), rest))`: the carry resolved into `text`; continue
    ///   decoding from `rest`.
    /// * `Some((Err(bytes), _))`: the carry resolved into an invalid
    ///   sequence.
    #[allow(clippy::type_complexity)]
    pub fn try_complete<'i>(
        &mut self,
        input: &'i [u8],
    ) -> Option<(Result<&str, &[u8]>, &'i [u8])> {
        let have = self.len as usize;
        let take = input.len().min(4 - have);
        self.buf[have..have + take].copy_from_slice(&input[..take]);
        let spliced = have + take;

        match simdutf8::compat::from_utf8(&self.buf[..spliced]) {
            Ok(_) => {
                self.len = 0;
                let text = unsafe { str::from_utf8_unchecked(&self.buf[..spliced]) };
                Some((Ok(text), &input[take..]))
            }

            Err(error) if error.valid_up_to() > 0 => {
                // The carried bytes never contain a code point boundary, so
                // the valid prefix always extends past them into `input`.
                let boundary = error.valid_up_to();
                let consumed = boundary - have;
                self.len = 0;
                let text = unsafe { str::from_utf8_unchecked(&self.buf[..boundary]) };
                Some((Ok(text), &input[consumed..]))
            }

            Err(error) => match error.error_len() {
                Some(bad) => {
                    let consumed = bad - have;
                    self.len = 0;
                    Some((Err(&self.buf[..bad]), &input[consumed..]))
                }

                None => {
                    self.len = spliced as u8;
                    None
                }
            },
        }
    }
}
