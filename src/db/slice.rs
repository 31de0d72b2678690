use std::io::{self, Read, Seek, SeekFrom};

/// A Read+Seek view of a sub-range of another Read+Seek. Used to hand out
/// the body portion of cache files that carry a serialized header up front.
pub struct SeekSlice<T: Seek> {
    inner: T,
    start: u64,
    end: u64,
    current: u64,
}

impl<T: Seek> SeekSlice<T> {
    pub fn new(mut inner: T, start: u64, end: u64) -> io::Result<SeekSlice<T>> {
        assert!(end >= start);
        let current = inner.seek(SeekFrom::Start(start))?;
        Ok(SeekSlice {
            inner,
            start,
            end,
            current,
        })
    }
}

impl<T: Seek> Seek for SeekSlice<T> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let goal: Option<u64> = match pos {
            SeekFrom::Start(offset) => self.start.checked_add(offset),
            SeekFrom::End(offset) => {
                if offset >= 0 {
                    self.end.checked_add(offset as u64)
                } else {
                    self.end.checked_sub(offset.wrapping_neg() as u64)
                }
            }
            SeekFrom::Current(offset) => {
                if offset >= 0 {
                    self.current.checked_add(offset as u64)
                } else {
                    self.current.checked_sub(offset.wrapping_neg() as u64)
                }
            }
        };
        match goal {
            Some(idx) if idx >= self.start && idx <= self.end => {
                self.current = self.inner.seek(SeekFrom::Start(idx))?;
                Ok(self.current - self.start)
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek outside of slice bounds",
            )),
        }
    }
}

impl<T: Read + Seek> Read for SeekSlice<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let max_read = std::cmp::min((self.end - self.current) as usize, buf.len());
        if max_read == 0 {
            return Ok(0);
        }
        let amount = self.inner.read(&mut buf[..max_read])?;
        self.current += amount as u64;
        Ok(amount)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_reads_stay_inside_window() {
        let buf: Vec<u8> = (0u8..10).collect();
        let mut slice = SeekSlice::new(Cursor::new(buf), 2, 8).unwrap();

        let mut got = Vec::new();
        slice.read_to_end(&mut got).unwrap();
        assert_eq!(got, vec![2, 3, 4, 5, 6, 7]);

        // EOF inside the window
        let mut one = [0u8; 1];
        assert_eq!(slice.read(&mut one).unwrap(), 0);
    }

    #[test]
    fn test_seeking_is_window_relative() {
        let buf: Vec<u8> = (0u8..10).collect();
        let mut slice = SeekSlice::new(Cursor::new(buf), 2, 8).unwrap();

        assert_eq!(slice.seek(SeekFrom::Start(1)).unwrap(), 1);
        let mut one = [0u8; 1];
        slice.read_exact(&mut one).unwrap();
        assert_eq!(one[0], 3);

        assert_eq!(slice.seek(SeekFrom::End(-1)).unwrap(), 5);
        slice.read_exact(&mut one).unwrap();
        assert_eq!(one[0], 7);

        assert!(slice.seek(SeekFrom::Current(10)).is_err());
        assert!(slice.seek(SeekFrom::Current(-100)).is_err());
    }
}
