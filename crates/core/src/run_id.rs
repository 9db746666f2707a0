//! Run identifier service.
//!
//! Canonical format is `YYMMDD-HHMMSS` (13 characters, UTC wall clock).
//! A compound run id appends `-<clientId>`. Client ids may contain hyphens,
//! so parsing always splits at byte 13 and never at the last hyphen.
//!
//! Legacy shapes (`SR-YYMMDD-NNN-T…-S…`, epoch milliseconds, task/step
//! embedded ids) are not recognised and never converted: an unrecognised id
//! is `None` from [`normalize`] and [`RunIdError::Invalid`] from the
//! enforcing helpers.

use time::{Date, Month, OffsetDateTime, Time, UtcOffset};

/// Length of the canonical timestamp portion (`YYMMDD-HHMMSS`).
pub const BASE_LEN: usize = 13;

/// Errors raised where run-id enforcement is enabled.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RunIdError {
    /// Input is empty or not in `YYMMDD-HHMMSS[-clientId]` form.
    #[error("invalid run id '{value}': expected YYMMDD-HHMMSS[-clientId]")]
    Invalid { value: String },

    /// A base run id was required but a compound one was supplied.
    #[error("run id '{value}' carries a client suffix where a base run id is required")]
    UnexpectedClient { value: String },
}

/// Options for [`normalize`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NormalizeOptions {
    /// Return the base form even when the input carries a client suffix.
    pub strip_client: bool,
}

/// A validated run id split into its timestamp and optional client suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedRunId<'a> {
    base: &'a str,
    client: Option<&'a str>,
}

impl<'a> ParsedRunId<'a> {
    /// The canonical `YYMMDD-HHMMSS` portion.
    pub fn base(&self) -> &'a str {
        self.base
    }

    /// The client suffix, if this is a compound id.
    pub fn client(&self) -> Option<&'a str> {
        self.client
    }
}

/// Mint a base run id from the current UTC wall clock.
///
/// Two calls within the same second return the same id: one run, one
/// timestamp.
pub fn mint() -> String {
    mint_at(OffsetDateTime::now_utc())
}

/// Mint a base run id for the given instant (converted to UTC).
pub fn mint_at(at: OffsetDateTime) -> String {
    let at = at.to_offset(UtcOffset::UTC);
    format!(
        "{:02}{:02}{:02}-{:02}{:02}{:02}",
        at.year().rem_euclid(100),
        u8::from(at.month()),
        at.day(),
        at.hour(),
        at.minute(),
        at.second()
    )
}

/// Attach a client suffix, replacing any suffix already present.
///
/// An empty (or all-whitespace) client id yields the base id.
pub fn with_client(rid: &str, client_id: &str) -> String {
    let base = strip_client(rid);
    let client = client_id.trim();
    if client.is_empty() {
        base.to_string()
    } else {
        format!("{base}-{client}")
    }
}

/// Return the 13-character base of a run id. Malformed input is returned
/// unchanged.
pub fn strip_client(rid: &str) -> &str {
    match split(rid) {
        Some((base, _)) => base,
        None => rid,
    }
}

/// Whether the run id is a well-formed compound id.
pub fn has_client(rid: &str) -> bool {
    matches!(split(rid), Some((_, Some(_))))
}

/// The client suffix of a compound run id.
pub fn client_suffix(rid: &str) -> Option<&str> {
    split(rid).and_then(|(_, client)| client)
}

/// Validate a run id and return it in canonical form, or `None` when the
/// input is empty or unrecognisable. Never coerces.
pub fn normalize(rid: &str, opts: NormalizeOptions) -> Option<String> {
    let (base, client) = split(rid)?;
    match client {
        Some(_) if !opts.strip_client => Some(rid.to_string()),
        _ => Some(base.to_string()),
    }
}

/// Parse a base or compound run id.
pub fn parse(rid: &str) -> Result<ParsedRunId<'_>, RunIdError> {
    split(rid)
        .map(|(base, client)| ParsedRunId { base, client })
        .ok_or_else(|| RunIdError::Invalid {
            value: rid.to_string(),
        })
}

/// Require a base run id (no client suffix).
pub fn require_base(rid: &str) -> Result<&str, RunIdError> {
    let parsed = parse(rid)?;
    if parsed.client.is_some() {
        return Err(RunIdError::UnexpectedClient {
            value: rid.to_string(),
        });
    }
    Ok(parsed.base)
}

/// Whether `s` is exactly a canonical base id describing a real calendar
/// date and time of day.
pub fn is_canonical_base(s: &str) -> bool {
    let bytes = s.as_bytes();
    if bytes.len() != BASE_LEN || bytes[6] != b'-' {
        return false;
    }
    if !bytes[..6]
        .iter()
        .chain(&bytes[7..])
        .all(u8::is_ascii_digit)
    {
        return false;
    }

    let field = |i: usize| (bytes[i] - b'0') * 10 + (bytes[i + 1] - b'0');
    let Ok(month) = Month::try_from(field(2)) else {
        return false;
    };
    Date::from_calendar_date(2000 + i32::from(field(0)), month, field(4)).is_ok()
        && Time::from_hms(field(7), field(9), field(11)).is_ok()
}

fn split(rid: &str) -> Option<(&str, Option<&str>)> {
    let base = rid.get(..BASE_LEN)?;
    if !is_canonical_base(base) {
        return None;
    }
    match &rid[BASE_LEN..] {
        "" => Some((base, None)),
        rest => {
            let client = rest.strip_prefix('-')?;
            if client.is_empty() {
                None
            } else {
                Some((base, Some(client)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn mint_formats_utc_timestamp() {
        assert_eq!(mint_at(datetime!(2025-03-07 09:05:01 UTC)), "250307-090501");
    }

    #[test]
    fn mint_converts_offsets_to_utc() {
        assert_eq!(mint_at(datetime!(2025-03-07 23:30:00 -2)), "250308-013000");
    }

    #[test]
    fn mint_is_stable_within_a_second() {
        let a = mint_at(datetime!(2025-01-01 12:00:00.100 UTC));
        let b = mint_at(datetime!(2025-01-01 12:00:00.900 UTC));
        assert_eq!(a, b);
    }

    #[test]
    fn with_client_appends_suffix() {
        assert_eq!(with_client("250101-120000", "acme"), "250101-120000-acme");
    }

    #[test]
    fn with_client_replaces_existing_suffix() {
        let compound = with_client("250101-120000", "Guy-Wilson");
        assert_eq!(with_client(&compound, "acme"), "250101-120000-acme");
    }

    #[test]
    fn with_client_empty_client_yields_base() {
        assert_eq!(with_client("250101-120000-acme", "  "), "250101-120000");
    }

    #[test]
    fn strip_client_handles_hyphenated_clients() {
        assert_eq!(strip_client("250101-120000-Guy-Wilson"), "250101-120000");
        assert_eq!(client_suffix("250101-120000-Guy-Wilson"), Some("Guy-Wilson"));
    }

    #[test]
    fn strip_client_returns_malformed_input_unchanged() {
        assert_eq!(strip_client("SR-250101-001-T123-S1"), "SR-250101-001-T123-S1");
        assert_eq!(strip_client("garbage"), "garbage");
        assert_eq!(strip_client(""), "");
    }

    #[test]
    fn has_client_distinguishes_forms() {
        assert!(!has_client("250101-120000"));
        assert!(has_client("250101-120000-acme"));
        assert!(!has_client("250101-120000-"));
        assert!(!has_client("250101-1200000"));
    }

    #[test]
    fn normalize_rejects_legacy_and_empty() {
        let opts = NormalizeOptions::default();
        assert_eq!(normalize("", opts), None);
        assert_eq!(normalize("SR-250101-001-T123-S1", opts), None);
        assert_eq!(normalize("1735689600000", opts), None);
        assert_eq!(normalize(" 250101-120000", opts), None);
    }

    #[test]
    fn normalize_rejects_impossible_dates() {
        let opts = NormalizeOptions::default();
        assert_eq!(normalize("251301-120000", opts), None);
        assert_eq!(normalize("250230-120000", opts), None);
        assert_eq!(normalize("250101-246000", opts), None);
        assert_eq!(normalize("250101-125960", opts), None);
    }

    #[test]
    fn normalize_keeps_or_strips_suffix() {
        assert_eq!(
            normalize("250101-120000-acme", NormalizeOptions::default()).as_deref(),
            Some("250101-120000-acme")
        );
        assert_eq!(
            normalize("250101-120000-acme", NormalizeOptions { strip_client: true }).as_deref(),
            Some("250101-120000")
        );
    }

    #[test]
    fn require_base_rejects_compound() {
        assert_eq!(require_base("250101-120000"), Ok("250101-120000"));
        assert!(matches!(
            require_base("250101-120000-acme"),
            Err(RunIdError::UnexpectedClient { .. })
        ));
        assert!(matches!(
            require_base("not-a-run"),
            Err(RunIdError::Invalid { .. })
        ));
    }

    #[test]
    fn parse_exposes_parts() {
        let parsed = parse("250101-120000-a-b").unwrap();
        assert_eq!(parsed.base(), "250101-120000");
        assert_eq!(parsed.client(), Some("a-b"));
    }
}
