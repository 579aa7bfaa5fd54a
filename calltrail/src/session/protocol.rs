//! Control message formatting and reply parsing

use calltrail_common::{CMD_ANNOUNCE_BUFFER, CMD_FUNCTION_NAME, REPLY_ERROR_PREFIX};
use std::path::Path;

use crate::domain::MethodId;

/// Reply to `C:GetCounts`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Counts {
    /// Distinct methods the target has seen
    pub functions: u64,
    /// Records written to the shared buffer
    pub calls: u64,
    /// Bumped by the target each time it resets the buffer
    pub generation: u64,
}

/// `M:<path>,<size>`
#[must_use]
pub fn announce_buffer(path: &Path, size: usize) -> String {
    format!("{CMD_ANNOUNCE_BUFFER}{},{size}", path.display())
}

/// `F:<id>`
#[must_use]
pub fn function_name(id: MethodId) -> String {
    format!("{CMD_FUNCTION_NAME}{id}")
}

/// Parse `functions,calls,generation`.
///
/// Anything but three fields is malformed. A field that does not parse
/// reads as 0.
#[must_use]
pub fn parse_counts(reply: &str) -> Option<Counts> {
    let mut parts = reply.split(',');
    let (Some(functions), Some(calls), Some(generation), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return None;
    };
    let field = |s: &str| s.trim().parse::<u64>().unwrap_or(0);
    Some(Counts { functions: field(functions), calls: field(calls), generation: field(generation) })
}

/// Status code of an `E:<hex>` refusal, or `None` for any other reply.
///
/// A refusal whose code does not parse reports 0.
#[must_use]
pub fn parse_refusal(reply: &str) -> Option<u32> {
    let code = reply.strip_prefix(REPLY_ERROR_PREFIX)?.trim();
    let hex = code.strip_prefix("0x").or_else(|| code.strip_prefix("0X")).unwrap_or(code);
    Some(u32::from_str_radix(hex, 16).unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_announce_format() {
        let msg = announce_buffer(Path::new("/dev/shm/calltrail-data-7"), 4096);
        assert_eq!(msg, "M:/dev/shm/calltrail-data-7,4096");
    }

    #[test]
    fn test_function_name_format() {
        assert_eq!(function_name(MethodId(1234)), "F:1234");
    }

    #[test]
    fn test_parse_counts() {
        let counts = parse_counts("12,3400,2").unwrap();
        assert_eq!(counts, Counts { functions: 12, calls: 3400, generation: 2 });
    }

    #[test]
    fn test_parse_counts_bad_fields_read_zero() {
        let counts = parse_counts("x,10,").unwrap();
        assert_eq!(counts, Counts { functions: 0, calls: 10, generation: 0 });
    }

    #[test]
    fn test_parse_counts_wrong_arity() {
        assert_eq!(parse_counts("1,2"), None);
        assert_eq!(parse_counts("1,2,3,4"), None);
        assert_eq!(parse_counts("ok"), None);
    }

    #[test]
    fn test_parse_refusal() {
        assert_eq!(parse_refusal("E:80131376"), Some(0x8013_1376));
        assert_eq!(parse_refusal("E:0x8013136A"), Some(0x8013_136A));
        assert_eq!(parse_refusal("E:garbage"), Some(0));
        assert_eq!(parse_refusal("ok"), None);
    }
}
