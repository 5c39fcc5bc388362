//! 🏷️ Naming: deciding which concrete index a run writes to, before a single byte moves.
//!
//! 🎬 *[a reindex is about to begin. nobody knows its name yet. not even the reindex.]*
//!
//! Two strategies:
//! - **time-windowed full rebuild**: `books` + `yyyyMMdd` on 2024-03-01 writes into
//!   `books20240301` and the alias `books` gets cut over at the end.
//! - **everything else**: ask the backend what `books` currently resolves to. One
//!   `books<digits>` index behind it? Write there, alias stays. Nothing? Write to `books`
//!   itself, no alias games. Two or more? Somebody made a mess, and we refuse to pick.
//!
//! Time comes from a [`Clock`] so tests can pin it. Always UTC. 🦆

use chrono::{DateTime, Datelike, Timelike, Utc};
use tracing::debug;

use crate::backends::{AliasLookup, AliasMap, SearchBackend};
use crate::common::IndexIdentity;
use crate::errors::IndexError;

// ===== Clock =====

/// ⏰ Where "now" comes from.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// ⏰ The wall clock. Production uses this one.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// 🧊 A clock that stopped. Extremely useful in tests, mildly concerning elsewhere.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

// ===== Time-window patterns =====

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DateField {
    Year { width: usize },
    TwoDigitYear,
    Month { padded: bool },
    Day { padded: bool },
    Hour { padded: bool },
    Minute { padded: bool },
    Second { padded: bool },
    Millis,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PatternToken {
    Literal(String),
    Field(DateField),
}

/// 📅 A parsed date-format pattern such as `yyyyMMdd` or `yyyy.MM.dd'-'HH`.
///
/// Letters: `yyyy`/`yy`, `MM`/`M`, `dd`/`d`, `HH`/`H`, `mm`/`m`, `ss`/`s`, `SSS`.
/// `'quoted'` text is literal (`''` is a single quote). Any other non-letter is literal.
/// Any other letter is an error; we would rather fail at startup than name an index
/// after the wrong day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeWindowPattern {
    source: String,
    tokens: Vec<PatternToken>,
}

impl TimeWindowPattern {
    pub fn parse(pattern: &str) -> Result<Self, IndexError> {
        let invalid = |reason: String| IndexError::InvalidTimeWindow {
            pattern: pattern.to_string(),
            reason,
        };
        if pattern.is_empty() {
            return Err(invalid("the pattern is empty".to_string()));
        }

        let chars: Vec<char> = pattern.chars().collect();
        let mut tokens = Vec::new();
        let mut literal = String::new();
        let mut i = 0;

        while i < chars.len() {
            let c = chars[i];
            if c == '\'' {
                // -- 📜 quoted literal, '' inside quotes (or on its own) is one quote character
                if chars.get(i + 1) == Some(&'\'') {
                    literal.push('\'');
                    i += 2;
                    continue;
                }
                let mut j = i + 1;
                loop {
                    match chars.get(j) {
                        None => return Err(invalid(format!("unterminated quote at position {i}"))),
                        Some('\'') if chars.get(j + 1) == Some(&'\'') => {
                            literal.push('\'');
                            j += 2;
                        }
                        Some('\'') => break,
                        Some(&other) => {
                            literal.push(other);
                            j += 1;
                        }
                    }
                }
                i = j + 1;
                continue;
            }

            if !c.is_ascii_alphabetic() {
                literal.push(c);
                i += 1;
                continue;
            }

            let run = chars[i..].iter().take_while(|&&other| other == c).count();
            let field = match (c, run) {
                ('y', 2) => DateField::TwoDigitYear,
                ('y', width) => DateField::Year { width },
                ('M', 1) => DateField::Month { padded: false },
                ('M', 2) => DateField::Month { padded: true },
                ('d', 1) => DateField::Day { padded: false },
                ('d', 2) => DateField::Day { padded: true },
                ('H', 1) => DateField::Hour { padded: false },
                ('H', 2) => DateField::Hour { padded: true },
                ('m', 1) => DateField::Minute { padded: false },
                ('m', 2) => DateField::Minute { padded: true },
                ('s', 1) => DateField::Second { padded: false },
                ('s', 2) => DateField::Second { padded: true },
                ('S', 3) => DateField::Millis,
                (letter, count) => {
                    return Err(invalid(format!(
                        "'{}' is not a supported pattern field",
                        letter.to_string().repeat(count)
                    )));
                }
            };
            if !literal.is_empty() {
                tokens.push(PatternToken::Literal(std::mem::take(&mut literal)));
            }
            tokens.push(PatternToken::Field(field));
            i += run;
        }
        if !literal.is_empty() {
            tokens.push(PatternToken::Literal(literal));
        }

        Ok(Self {
            source: pattern.to_string(),
            tokens,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// 🖨️ Render the pattern for one instant.
    pub fn format(&self, at: DateTime<Utc>) -> String {
        let mut rendered = String::new();
        for token in &self.tokens {
            match token {
                PatternToken::Literal(text) => rendered.push_str(text),
                PatternToken::Field(field) => rendered.push_str(&render_field(*field, at)),
            }
        }
        rendered
    }
}

fn padded_or_not(value: u32, padded: bool) -> String {
    if padded { format!("{value:02}") } else { value.to_string() }
}

fn render_field(field: DateField, at: DateTime<Utc>) -> String {
    match field {
        DateField::Year { width } => format!("{:0width$}", at.year(), width = width),
        DateField::TwoDigitYear => format!("{:02}", at.year().rem_euclid(100)),
        DateField::Month { padded } => padded_or_not(at.month(), padded),
        DateField::Day { padded } => padded_or_not(at.day(), padded),
        DateField::Hour { padded } => padded_or_not(at.hour(), padded),
        DateField::Minute { padded } => padded_or_not(at.minute(), padded),
        DateField::Second { padded } => padded_or_not(at.second(), padded),
        DateField::Millis => format!("{:03}", at.timestamp_subsec_millis().min(999)),
    }
}

// ===== Index-name validation =====

const FORBIDDEN_CHARS: &[char] = &['\\', '/', '*', '?', '"', '<', '>', '|', ',', '#', ' '];
const MAX_INDEX_NAME_BYTES: usize = 255;

/// 🚫 Reject names the backend would reject anyway, but earlier and with a nicer message.
pub fn validate_index_name(name: &str) -> Result<(), IndexError> {
    let reject = |reason: &'static str| {
        Err(IndexError::InvalidIndexName {
            name: name.to_string(),
            reason,
        })
    };
    if name.is_empty() {
        return reject("the name is empty");
    }
    if name == "." || name == ".." {
        return reject("'.' and '..' are reserved");
    }
    if name.starts_with(['-', '_', '+']) {
        return reject("names cannot start with '-', '_' or '+'");
    }
    if name.chars().any(char::is_uppercase) {
        return reject("names must be lowercase");
    }
    if name.contains(FORBIDDEN_CHARS) {
        return reject("names cannot contain \\ / * ? \" < > | , # or spaces");
    }
    if name.len() > MAX_INDEX_NAME_BYTES {
        return reject("names are limited to 255 bytes");
    }
    Ok(())
}

// ===== The policy =====

/// 🏷️ base name + optional time window + update flag, validated up front.
#[derive(Debug, Clone)]
pub struct NamingPolicy {
    base_name: String,
    time_window: Option<TimeWindowPattern>,
    update_mode: bool,
}

impl NamingPolicy {
    pub fn new(base_name: &str, time_window: Option<&str>, update_mode: bool) -> Result<Self, IndexError> {
        validate_index_name(base_name)?;
        let time_window = time_window.map(TimeWindowPattern::parse).transpose()?;
        Ok(Self {
            base_name: base_name.to_string(),
            time_window,
            update_mode,
        })
    }

    pub fn base_name(&self) -> &str {
        &self.base_name
    }

    pub fn update_mode(&self) -> bool {
        self.update_mode
    }

    /// 🎯 Decide the identity of this run. Consults the backend only when there is no
    /// fresh time-windowed name to mint.
    pub async fn resolve<B: SearchBackend + ?Sized>(
        &self,
        backend: &B,
        clock: &dyn Clock,
    ) -> Result<IndexIdentity, IndexError> {
        if let (Some(window), false) = (&self.time_window, self.update_mode) {
            let concrete = format!("{}{}", self.base_name, window.format(clock.now()));
            validate_index_name(&concrete)?;
            debug!(
                "🏷️ time window '{}' minted '{}' behind alias '{}'",
                window.as_str(),
                concrete,
                self.base_name
            );
            return Ok(IndexIdentity::aliased(&self.base_name, concrete));
        }

        let the_aliases = backend.get_aliases(AliasLookup::Alias(&self.base_name)).await?;
        let the_identity = pick_candidate(&self.base_name, &the_aliases)?;
        debug!("🏷️ alias lookup for '{}' settled on {:?}", self.base_name, the_identity);
        Ok(the_identity)
    }
}

/// 🔢 `books` followed by one or more ASCII digits, and nothing else.
fn is_numbered_sibling(base_name: &str, index_name: &str) -> bool {
    index_name
        .strip_prefix(base_name)
        .is_some_and(|suffix| !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()))
}

/// 🎯 Pick the concrete index from what the alias currently resolves to.
pub fn pick_candidate(base_name: &str, aliases: &AliasMap) -> Result<IndexIdentity, IndexError> {
    let the_candidates: Vec<&String> = aliases
        .keys()
        .filter(|index_name| is_numbered_sibling(base_name, index_name))
        .collect();

    match the_candidates.as_slice() {
        [] => Ok(IndexIdentity::direct(base_name)),
        [only] => Ok(IndexIdentity::aliased(base_name, only.as_str())),
        many => Err(IndexError::AliasAmbiguity {
            alias: base_name.to_string(),
            indices: many.iter().map(|name| name.to_string()).collect(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::InMemoryBackend;
    use anyhow::Result;
    use chrono::TimeZone;

    fn march_first() -> FixedClock {
        FixedClock(
            Utc.with_ymd_and_hms(2024, 3, 1, 7, 5, 9)
                .single()
                .expect("💀 2024-03-01 exists, last time anyone checked"),
        )
    }

    #[tokio::test]
    async fn the_one_where_march_first_gets_its_own_index() -> Result<()> {
        let the_backend = InMemoryBackend::new();
        let the_policy = NamingPolicy::new("books", Some("yyyyMMdd"), false)?;

        let the_identity = the_policy.resolve(&the_backend, &march_first()).await?;
        assert_eq!(the_identity, IndexIdentity::aliased("books", "books20240301"));

        // -- 🔁 same clock, same answer, every time
        let the_again = the_policy.resolve(&the_backend, &march_first()).await?;
        assert_eq!(the_identity, the_again);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_two_numbered_indices_fight_over_one_alias() -> Result<()> {
        let the_backend = InMemoryBackend::new();
        the_backend.seed_index("books1", &[("books", None)], &[]).await;
        the_backend.seed_index("books2", &[("books", None)], &[]).await;

        let the_policy = NamingPolicy::new("books", None, false)?;
        let the_error = the_policy
            .resolve(&the_backend, &march_first())
            .await
            .expect_err("💀 two candidates must not resolve");
        match the_error {
            IndexError::AliasAmbiguity { alias, indices } => {
                assert_eq!(alias, "books");
                assert_eq!(indices, vec!["books1".to_string(), "books2".to_string()]);
            }
            other => panic!("💀 expected AliasAmbiguity, got {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_lonely_alias_keeps_its_index() -> Result<()> {
        let the_backend = InMemoryBackend::new();
        the_backend.seed_index("books7", &[("books", None)], &[]).await;
        // -- 🙈 not a numbered sibling, does not count
        the_backend.seed_index("books-archive", &[("books", None)], &[]).await;

        let the_policy = NamingPolicy::new("books", None, true)?;
        let the_identity = the_policy.resolve(&the_backend, &march_first()).await?;
        assert_eq!(the_identity, IndexIdentity::aliased("books", "books7"));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_nobody_is_home_so_we_write_direct() -> Result<()> {
        let the_backend = InMemoryBackend::new();
        let the_policy = NamingPolicy::new("books", None, false)?;
        let the_identity = the_policy.resolve(&the_backend, &march_first()).await?;
        assert_eq!(the_identity, IndexIdentity::direct("books"));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_update_mode_ignores_the_calendar() -> Result<()> {
        let the_backend = InMemoryBackend::new();
        the_backend.seed_index("books20240229", &[("books", None)], &[]).await;

        let the_policy = NamingPolicy::new("books", Some("yyyyMMdd"), true)?;
        let the_identity = the_policy.resolve(&the_backend, &march_first()).await?;
        assert_eq!(the_identity, IndexIdentity::aliased("books", "books20240229"));
        Ok(())
    }

    #[test]
    fn the_one_where_patterns_speak_many_dialects() -> Result<()> {
        let the_clock = march_first();
        let the_cases = [
            ("yyyyMMdd", "20240301"),
            ("yy.M.d", "24.3.1"),
            ("yyyy-MM-dd'T'HH", "2024-03-01T07"),
            ("HHmmss", "070509"),
            ("'week'''yyyy", "week'2024"),
            ("yyyyMMddSSS", "20240301000"),
        ];
        for (pattern, expected) in the_cases {
            let the_pattern = TimeWindowPattern::parse(pattern)?;
            assert_eq!(the_pattern.format(the_clock.now()), expected, "pattern {pattern}");
        }
        Ok(())
    }

    #[test]
    fn the_one_where_unknown_letters_are_turned_away() {
        for pattern in ["yyyyMMMdd", "EEE", "yyyy'oops", "", "yyyyww"] {
            assert!(
                matches!(
                    TimeWindowPattern::parse(pattern),
                    Err(IndexError::InvalidTimeWindow { .. })
                ),
                "pattern {pattern:?} should be rejected"
            );
        }
    }

    #[test]
    fn the_one_where_index_names_have_a_dress_code() {
        for bad in ["", "Books", "_books", "-books", "+books", "bo oks", "books*", "a/b", ".", "..", "bo#ks"] {
            assert!(
                matches!(validate_index_name(bad), Err(IndexError::InvalidIndexName { .. })),
                "{bad:?} should be rejected"
            );
        }
        for good in ["books", "books-2024", "books.v2", "b_1"] {
            assert!(validate_index_name(good).is_ok(), "{good:?} should pass");
        }
    }

    #[test]
    fn the_one_where_only_numbered_siblings_count() {
        assert!(is_numbered_sibling("books", "books1"));
        assert!(is_numbered_sibling("books", "books20240301"));
        assert!(!is_numbered_sibling("books", "books"));
        assert!(!is_numbered_sibling("books", "books-1"));
        assert!(!is_numbered_sibling("books", "booksx1"));
        assert!(!is_numbered_sibling("books", "ebooks1"));
    }
}
