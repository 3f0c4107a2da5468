use std::fmt;

/// A `fmt::Write` sink backed by an inline array. Formatting into it never
/// allocates, which makes it usable from a signal handler.
pub struct FixedBuf<const N: usize> {
    buf: [u8; N],
    len: usize,
    truncated: bool,
}

impl<const N: usize> FixedBuf<N> {
    pub const fn new() -> Self {
        Self {
            buf: [0; N],
            len: 0,
            truncated: false,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn as_str(&self) -> &str {
        // Only whole `str` fragments are ever copied in, but truncation can
        // split a multi-byte character.
        match std::str::from_utf8(self.as_bytes()) {
            Ok(s) => s,
            Err(e) => {
                // SAFETY: `valid_up_to` is a char boundary.
                unsafe { std::str::from_utf8_unchecked(&self.buf[..e.valid_up_to()]) }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn clear(&mut self) {
        self.len = 0;
        self.truncated = false;
    }
}

impl<const N: usize> Default for FixedBuf<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> fmt::Write for FixedBuf<N> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let available = N - self.len;
        let bytes = s.as_bytes();
        if bytes.len() > available {
            self.buf[self.len..].copy_from_slice(&bytes[..available]);
            self.len = N;
            self.truncated = true;
            return Err(fmt::Error);
        }
        self.buf[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt::Write;

    #[test]
    fn formats_without_allocating() {
        let mut buf = FixedBuf::<64>::new();
        write!(buf, "$ | {} | {:#x}", 42, 0x401000).unwrap();
        assert_eq!(buf.as_str(), "$ | 42 | 0x401000");
        assert!(!buf.is_truncated());
    }

    #[test]
    fn truncates_when_full() {
        let mut buf = FixedBuf::<8>::new();
        assert!(write!(buf, "0123456789").is_err());
        assert_eq!(buf.as_str(), "01234567");
        assert!(buf.is_truncated());

        buf.clear();
        assert!(buf.is_empty());
        assert!(!buf.is_truncated());
    }
}
