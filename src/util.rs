use core::convert::TryInto;

pub(crate) fn is_default<T: Default + PartialEq>(t: &T) -> bool {
    *t == Default::default()
}

pub fn hex_serialize<S, T>(x: &T, s: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
    T: AsRef<[u8]>,
{
    s.serialize_str(&hex::encode_upper(x.as_ref()))
}

pub fn hex_deserialize<'de, D, const N: usize>(deserializer: D) -> Result<[u8; N], D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = serde::de::Deserialize::deserialize(deserializer)?;
    parse_hex(&s).ok_or_else(|| serde::de::Error::custom(format!("expected {} hex bytes, got {:?}", N, s)))
}

pub fn hex_deserialize_opt<'de, D, const N: usize>(deserializer: D) -> Result<Option<[u8; N]>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: Option<String> = serde::de::Deserialize::deserialize(deserializer)?;
    match s {
        Some(s) => parse_hex(&s)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("expected {} hex bytes, got {:?}", N, s))),
        None => Ok(None),
    }
}

/// Parse exactly `N` bytes of hex, ignoring whitespace.
pub fn parse_hex<const N: usize>(s: &str) -> Option<[u8; N]> {
    let mut s = String::from(s);
    s.retain(|c| !c.is_whitespace());
    hex::decode(&s).ok()?.try_into().ok()
}

/// Parse the leading `N` bytes of hex in `text`, ignoring anything after them.
///
/// Identifier files are often saved with a trailing newline or comment.
pub fn parse_hex_prefix<const N: usize>(text: &str) -> Option<[u8; N]> {
    let text = text.trim_start();
    parse_hex(text.get(..2 * N)?)
}

/// A NUL-terminated ASCII name field.
pub fn c_str(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

/// Write `name` into a fixed NUL-padded field, truncating if needed.
pub fn put_c_str(field: &mut [u8], name: &str) {
    field.fill(0);
    let len = name.len().min(field.len().saturating_sub(1));
    field[..len].copy_from_slice(&name.as_bytes()[..len]);
}

pub fn to_mebi(bytes: u64) -> String {
    format!("{:.2}", bytes as f64 / (1u64 << 20) as f64)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hex_with_whitespace() {
        assert_eq!(parse_hex::<4>("de ad\nbe ef"), Some([0xde, 0xad, 0xbe, 0xef]));
        assert_eq!(parse_hex::<4>("deadbe"), None);
        assert_eq!(parse_hex::<2>("zz00"), None);
    }

    #[test]
    fn hex_prefix_ignores_trailer() {
        assert_eq!(parse_hex_prefix::<2>("  abCD\r\n# from backup"), Some([0xab, 0xcd]));
        assert_eq!(parse_hex_prefix::<2>("abc"), None);
    }

    #[test]
    fn c_strings() {
        let mut field = [0xffu8; 8];
        put_c_str(&mut field, "Root-CA00000001");
        assert_eq!(&field, b"Root-CA\0");
        assert_eq!(c_str(&field), "Root-CA");
        assert_eq!(c_str(b"CP00000007"), "CP00000007");
    }

    #[test]
    fn mebibytes() {
        assert_eq!(to_mebi(3 << 19), "1.50");
    }
}
