use core::fmt;

/// Bytes shown before a payload preview is cut short.
const PREVIEW_LEN: usize = 16;

/// Hex rendering of a payload for trace logs. Long payloads are truncated
/// and suffixed with the number of bytes left out.
pub struct HexPreview<'a>(&'a [u8]);

impl<'a> HexPreview<'a> {
    fn new<T>(data: &'a T) -> HexPreview<'a>
    where
        T: ?Sized + AsRef<[u8]> + 'a,
    {
        HexPreview(data.as_ref())
    }
}

impl fmt::Display for HexPreview<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.iter().take(PREVIEW_LEN) {
            write!(f, "{:02x}", byte)?;
        }
        if self.0.len() > PREVIEW_LEN {
            write!(f, "..(+{})", self.0.len() - PREVIEW_LEN)?;
        }
        Ok(())
    }
}

impl fmt::Debug for HexPreview<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

pub trait HexDisplayExt {
    fn hex(&self) -> HexPreview<'_>;
}

impl<T> HexDisplayExt for T
where
    T: ?Sized + AsRef<[u8]>,
{
    fn hex(&self) -> HexPreview<'_> {
        HexPreview::new(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_payload_is_printed_whole() {
        assert_eq!([0x0au8, 0xff, 0x00].hex().to_string(), "0aff00");
    }

    #[test]
    fn test_long_payload_is_truncated() {
        let data = vec![1u8; 20];
        let shown = data.hex().to_string();
        assert!(shown.starts_with("0101"));
        assert!(shown.ends_with("..(+4)"));
    }
}
