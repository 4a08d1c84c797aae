//! Calendar data from markdown notes.
//!
//! Two document shapes are understood: *event notes* (a `---` metadata block,
//! a heading naming the event, free prose) and *daily notes* (a date heading
//! followed by one bullet per agenda entry). Parsing is pure and returns
//! `None` when a document carries no renderable calendar data. The only
//! shared mutable state is the explicitly constructed [`CategoryRegistry`].

pub mod core {
    use chrono::NaiveDate;
    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};
    use serde_with::{DeserializeFromStr, SerializeDisplay};
    use std::{collections::BTreeSet, fmt, str::FromStr};

    /* ---------------------------- Value Objects ---------------------------- */

    /// Tag name, stored without the leading `#`.
    #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct Tag(pub String);

    impl Tag {
        pub fn as_str(&self) -> &str {
            &self.0
        }
    }

    impl From<&str> for Tag {
        fn from(s: &str) -> Self {
            Self(s.to_string())
        }
    }

    impl fmt::Display for Tag {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.0)
        }
    }

    /// Wall-clock time of day (`HH:MM`, 24-hour). No timezone.
    #[derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        SerializeDisplay,
        DeserializeFromStr,
    )]
    pub struct ClockTime {
        hour: u8,
        minute: u8,
    }

    impl ClockTime {
        /// Returns `None` unless `hour < 24` and `minute < 60`.
        pub fn new(hour: u8, minute: u8) -> Option<Self> {
            (hour < 24 && minute < 60).then_some(Self { hour, minute })
        }

        pub fn hour(&self) -> u8 {
            self.hour
        }

        pub fn minute(&self) -> u8 {
            self.minute
        }

        pub fn minutes_since_midnight(&self) -> u16 {
            u16::from(self.hour) * 60 + u16::from(self.minute)
        }
    }

    impl fmt::Display for ClockTime {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{:02}:{:02}", self.hour, self.minute)
        }
    }

    impl FromStr for ClockTime {
        type Err = DomainError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            crate::time::parse_clock_time(s).ok_or_else(|| DomainError::InvalidTime(s.to_string()))
        }
    }

    /// Start time with an optional end on the same day.
    ///
    /// A missing `end` is a point in time, not a zero-length span. The pair is
    /// kept exactly as written: an `end` before `start` is representable and
    /// reported by [`TimeRange::is_ordered`] rather than corrected.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct TimeRange {
        pub start: ClockTime,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub end: Option<ClockTime>,
    }

    impl TimeRange {
        pub fn point(start: ClockTime) -> Self {
            Self { start, end: None }
        }

        pub fn span(start: ClockTime, end: ClockTime) -> Self {
            Self {
                start,
                end: Some(end),
            }
        }

        pub fn is_ordered(&self) -> bool {
            self.end.is_none_or(|end| end >= self.start)
        }

        /// Length in minutes; `None` for points and out-of-order pairs.
        pub fn duration_minutes(&self) -> Option<u16> {
            let end = self.end?;
            end.minutes_since_midnight()
                .checked_sub(self.start.minutes_since_midnight())
        }
    }

    impl fmt::Display for TimeRange {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self.end {
                Some(end) => write!(f, "{}-{}", self.start, end),
                None => write!(f, "{}", self.start),
            }
        }
    }

    impl FromStr for TimeRange {
        type Err = DomainError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            crate::time::parse_time_range(s)
                .ok_or_else(|| DomainError::InvalidTimeRange(s.to_string()))
        }
    }

    /* ------------------------------ Event notes ------------------------------ */

    /// One calendar event derived from one markdown document.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct EventNote {
        pub title: String,
        pub start: NaiveDate,
        /// Equal to `start` when the document does not name an end date.
        pub end: NaiveDate,
        #[serde(default)]
        pub all_day: bool,
        /// Only meaningful when `all_day` is false.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub time: Option<TimeRange>,
        #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
        pub tags: BTreeSet<Tag>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub body: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub metadata: Option<EventMetadata>,
    }

    impl EventNote {
        /// A single-day, all-day event with no tags, body or metadata.
        pub fn new(title: impl Into<String>, start: NaiveDate) -> Self {
            Self {
                title: title.into(),
                start,
                end: start,
                all_day: true,
                time: None,
                tags: BTreeSet::new(),
                body: None,
                metadata: None,
            }
        }

        /// Checks the cross-field invariants of an event.
        ///
        /// The parsers only build notes whose dates are ordered; this is the
        /// check for out-of-order times and for notes assembled by hand.
        pub fn check_invariants(&self) -> Result<(), InvariantError> {
            if self.title.trim().is_empty() {
                return Err(InvariantError::EmptyTitle);
            }
            if self.end < self.start {
                return Err(InvariantError::EndBeforeStart {
                    start: self.start,
                    end: self.end,
                });
            }
            if let Some(time) = &self.time {
                if self.all_day {
                    return Err(InvariantError::TimeOnAllDay);
                }
                if let Some(end) = time.end {
                    if end < time.start {
                        return Err(InvariantError::TimeOutOfOrder {
                            start: time.start,
                            end,
                        });
                    }
                }
            }
            Ok(())
        }

        pub fn occurs_on(&self, date: NaiveDate) -> bool {
            self.start <= date && date <= self.end
        }

        /// Every calendar day covered by the event, `start..=end`.
        pub fn days(&self) -> impl Iterator<Item = NaiveDate> {
            let end = self.end;
            self.start.iter_days().take_while(move |day| *day <= end)
        }
    }

    /// Open record of extra fields from the metadata block.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct EventMetadata {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub location: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub memo: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub url: Option<String>,
        /// Unrecognized scalar keys, in source order.
        #[serde(flatten)]
        pub extra: IndexMap<String, String>,
    }

    impl EventMetadata {
        pub fn is_empty(&self) -> bool {
            self.location.is_none()
                && self.memo.is_none()
                && self.url.is_none()
                && self.extra.is_empty()
        }

        /// All key/value pairs: the known keys first, then `extra`.
        pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
            [
                ("location", self.location.as_deref()),
                ("memo", self.memo.as_deref()),
                ("url", self.url.as_deref()),
            ]
            .into_iter()
            .filter_map(|(key, value)| value.map(|v| (key, v)))
            .chain(
                self.extra
                    .iter()
                    .map(|(key, value)| (key.as_str(), value.as_str())),
            )
        }
    }

    /* ------------------------------ Daily notes ------------------------------ */

    /// A day's agenda; entry order is source line order.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct DailyNote {
        pub date: NaiveDate,
        #[serde(default)]
        pub entries: Vec<Entry>,
    }

    impl DailyNote {
        /// Union of the tags of all entries.
        pub fn tags(&self) -> BTreeSet<Tag> {
            self.entries
                .iter()
                .flat_map(|entry| entry.tags.iter().cloned())
                .collect()
        }

        pub fn entries_tagged<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a Entry> {
            self.entries
                .iter()
                .filter(move |entry| entry.tags.iter().any(|t| t.as_str() == tag))
        }
    }

    /// One agenda item of a daily note.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Entry {
        /// Display text with time token, checkbox and tags removed.
        pub title: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub time: Option<TimeRange>,
        #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
        pub tags: BTreeSet<Tag>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub checkbox: Option<Checkbox>,
    }

    /// `[ ]` or `[x]` at the start of a bullet.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum Checkbox {
        Empty,
        Checked,
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum DomainError {
        #[error("invalid time {0:?} (expected HH:MM)")]
        InvalidTime(String),
        #[error("invalid time range {0:?} (expected HH:MM or HH:MM-HH:MM)")]
        InvalidTimeRange(String),
    }

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum InvariantError {
        #[error("event title is empty")]
        EmptyTitle,
        #[error("end date {end} precedes start date {start}")]
        EndBeforeStart { start: NaiveDate, end: NaiveDate },
        #[error("end time {end} precedes start time {start}")]
        TimeOutOfOrder { start: ClockTime, end: ClockTime },
        #[error("all-day event carries a time range")]
        TimeOnAllDay,
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn t(h: u8, m: u8) -> ClockTime {
            ClockTime::new(h, m).unwrap()
        }

        fn day(s: &str) -> NaiveDate {
            NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
        }

        #[test]
        fn clock_time_bounds() {
            assert!(ClockTime::new(23, 59).is_some());
            assert!(ClockTime::new(24, 0).is_none());
            assert!(ClockTime::new(12, 60).is_none());
            assert_eq!(t(7, 5).to_string(), "07:05");
        }

        #[test]
        fn time_range_ordering_is_reported_not_fixed() {
            let backwards = TimeRange::span(t(11, 0), t(10, 0));
            assert!(!backwards.is_ordered());
            assert_eq!(backwards.duration_minutes(), None);
            assert_eq!(backwards.to_string(), "11:00-10:00");

            let forwards = TimeRange::span(t(9, 0), t(10, 30));
            assert!(forwards.is_ordered());
            assert_eq!(forwards.duration_minutes(), Some(90));
            assert!(TimeRange::point(t(9, 0)).is_ordered());
        }

        #[test]
        fn time_range_serializes_as_strings() {
            let json = serde_json::to_value(TimeRange::span(t(9, 0), t(10, 0))).unwrap();
            assert_eq!(json, serde_json::json!({"start": "09:00", "end": "10:00"}));

            let point: TimeRange = serde_json::from_str(r#"{"start":"08:15"}"#).unwrap();
            assert_eq!(point, TimeRange::point(t(8, 15)));
            assert!(serde_json::from_str::<TimeRange>(r#"{"start":"8:15"}"#).is_err());
        }

        #[test]
        fn invariants_flag_each_violation() {
            let mut note = EventNote::new("Trip", day("2025-03-01"));
            assert_eq!(note.check_invariants(), Ok(()));

            note.end = day("2025-02-28");
            assert!(matches!(
                note.check_invariants(),
                Err(InvariantError::EndBeforeStart { .. })
            ));

            note.end = note.start;
            note.time = Some(TimeRange::point(t(9, 0)));
            assert_eq!(note.check_invariants(), Err(InvariantError::TimeOnAllDay));

            note.all_day = false;
            note.time = Some(TimeRange::span(t(10, 0), t(9, 0)));
            assert!(matches!(
                note.check_invariants(),
                Err(InvariantError::TimeOutOfOrder { .. })
            ));

            note.time = None;
            note.title = "  ".into();
            assert_eq!(note.check_invariants(), Err(InvariantError::EmptyTitle));
        }

        #[test]
        fn multi_day_event_covers_each_day() {
            let mut note = EventNote::new("Conference", day("2025-01-30"));
            note.end = day("2025-02-02");
            let days: Vec<_> = note.days().map(|d| d.to_string()).collect();
            assert_eq!(
                days,
                ["2025-01-30", "2025-01-31", "2025-02-01", "2025-02-02"]
            );
            assert!(note.occurs_on(day("2025-02-01")));
            assert!(!note.occurs_on(day("2025-02-03")));
        }

        #[test]
        fn metadata_fields_lists_known_keys_then_extra() {
            let mut meta = EventMetadata {
                location: Some("Room 4".into()),
                url: Some("https://example.com".into()),
                ..Default::default()
            };
            meta.extra.insert("organizer".into(), "Aki".into());
            let fields: Vec<_> = meta.fields().collect();
            assert_eq!(
                fields,
                [
                    ("location", "Room 4"),
                    ("url", "https://example.com"),
                    ("organizer", "Aki"),
                ]
            );
            assert!(EventMetadata::default().is_empty());
        }
    }
}

pub mod config {
    //! Parser options and the JSON config file read by the CLI.

    use crate::category::CategoryRegistry;
    use anyhow::{Context, Result};
    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};
    use std::{fs, path::Path};

    /// Characters allowed in a tag name after the `#`.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct TagSyntax {
        /// Accept any Unicode alphanumeric; otherwise ASCII only.
        pub unicode: bool,
        /// Punctuation accepted in addition to alphanumerics.
        pub extra_chars: Vec<char>,
    }

    impl Default for TagSyntax {
        fn default() -> Self {
            Self {
                unicode: true,
                extra_chars: vec!['-', '_'],
            }
        }
    }

    impl TagSyntax {
        pub fn ascii() -> Self {
            Self {
                unicode: false,
                ..Self::default()
            }
        }

        pub fn is_tag_char(&self, c: char) -> bool {
            let alnum = if self.unicode {
                c.is_alphanumeric()
            } else {
                c.is_ascii_alphanumeric()
            };
            alnum || self.extra_chars.contains(&c)
        }

        pub fn is_valid_name(&self, name: &str) -> bool {
            !name.is_empty() && name.chars().all(|c| self.is_tag_char(c))
        }
    }

    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct ParseOptions {
        pub tag_syntax: TagSyntax,
    }

    /// Contents of a `notecal` config file.
    ///
    /// ```json
    /// { "parse": { "tag_syntax": { "unicode": false } },
    ///   "categories": { "work": "#4A90D9" } }
    /// ```
    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct NotecalConfig {
        pub parse: ParseOptions,
        /// Tag name to color, used to seed the category registry.
        pub categories: IndexMap<String, String>,
    }

    impl NotecalConfig {
        pub fn from_json_str(text: &str) -> Result<Self> {
            serde_json::from_str(text).context("parsing notecal config")
        }

        pub fn load(path: &Path) -> Result<Self> {
            let text = fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
            Self::from_json_str(&text).with_context(|| format!("loading config {:?}", path))
        }

        pub fn registry(&self) -> CategoryRegistry {
            CategoryRegistry::from_palette(&self.categories)
        }
    }

}

pub mod scan {
    //! Line classification shared by the event and daily parsers.
    //!
    //! Every line is mapped to a [`Line`] variant first; the parsers only
    //! interpret variants and never slice raw text themselves.

    use log::{debug, trace};
    use nom::{
        IResult,
        branch::alt,
        character::complete::{char, one_of, space0, space1},
        combinator::{eof, recognize},
        error::VerboseError,
        multi::many_m_n,
    };

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    const FENCE: &str = "---";

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Line<'a> {
        /// `---` on its own line.
        MetadataFence,
        /// `#` to `######` followed by a space; `text` has any closing `#`s removed.
        Heading { level: u8, text: &'a str },
        /// `-`, `*` or `+` list item.
        Bullet { indent: usize, text: &'a str },
        Prose(&'a str),
        Blank,
    }

    /// Document split into its leading metadata block and the rest.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Document<'a> {
        /// Raw text between the fences, `None` when the document has no block.
        pub metadata: Option<&'a str>,
        pub body: &'a str,
    }

    pub fn classify_line(raw: &str) -> Line<'_> {
        let line = raw.trim_end_matches(['\r', '\n']);
        let kind = if line.trim().is_empty() {
            Line::Blank
        } else if line.trim_end() == FENCE {
            Line::MetadataFence
        } else if let Ok((_, (level, text))) = heading(line.trim_start()) {
            Line::Heading {
                level,
                text: heading_text(text),
            }
        } else if let Ok((_, (indent, text))) = bullet(line) {
            Line::Bullet { indent, text }
        } else {
            Line::Prose(line.trim())
        };
        trace!("classified {:?} as {:?}", line, kind);
        kind
    }

    pub fn scan_lines(input: &str) -> impl Iterator<Item = Line<'_>> {
        input.lines().map(classify_line)
    }

    /// Splits off a leading `---` block (blank lines before it are allowed).
    ///
    /// Returns `None` for an opening fence without a closing one.
    pub fn split_metadata(input: &str) -> Option<Document<'_>> {
        let input = input.strip_prefix('\u{feff}').unwrap_or(input);
        let no_block = Document {
            metadata: None,
            body: input,
        };

        let mut lines = input.split_inclusive('\n');
        let mut block_start = None;
        let mut offset = 0;
        for line in lines.by_ref() {
            offset += line.len();
            match classify_line(line) {
                Line::Blank => continue,
                Line::MetadataFence => {
                    block_start = Some(offset);
                    break;
                }
                _ => return Some(no_block),
            }
        }
        let Some(block_start) = block_start else {
            return Some(no_block);
        };

        let mut cursor = block_start;
        for line in lines {
            if classify_line(line) == Line::MetadataFence {
                return Some(Document {
                    metadata: Some(&input[block_start..cursor]),
                    body: &input[cursor + line.len()..],
                });
            }
            cursor += line.len();
        }
        debug!("metadata block opened but never closed");
        None
    }

    fn heading(i: &str) -> PResult<'_, (u8, &str)> {
        let (i, hashes) = recognize(many_m_n(1, 6, char('#')))(i)?;
        let (i, _) = space1(i)?;
        Ok(("", (hashes.len() as u8, i)))
    }

    /// Drops an optional closing sequence (`## Title ##`); `C#` keeps its hash.
    fn heading_text(text: &str) -> &str {
        let text = text.trim();
        let stripped = text.trim_end_matches('#');
        if stripped.len() == text.len() {
            text
        } else if stripped.is_empty() || stripped.ends_with(char::is_whitespace) {
            stripped.trim_end()
        } else {
            text
        }
    }

    fn bullet(i: &str) -> PResult<'_, (usize, &str)> {
        let (i, indent) = space0(i)?;
        let (i, _) = one_of("-*+")(i)?;
        let (i, _) = alt((space1, eof))(i)?;
        Ok(("", (indent.len(), i.trim_end())))
    }

}

pub mod time {
    //! `HH:MM` / `HH:MM-HH:MM` tokens and `YYYY-MM-DD` dates.
    //!
    //! Extraction is structural: a token either parses completely or yields
    //! `None`. An end time before the start time is returned as written.

    use crate::core::{ClockTime, TimeRange};
    use chrono::NaiveDate;
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::take_while_m_n,
        character::complete::{char, one_of, space0, space1},
        combinator::{all_consuming, eof, map_opt, map_res, opt},
        error::VerboseError,
        sequence::{delimited, preceded, separated_pair, terminated, tuple},
    };

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    /// Parses `HH:MM`, `HH:MM-HH:MM` or either form wrapped in `[...]`.
    pub fn parse_time_range(token: &str) -> Option<TimeRange> {
        let token = token.trim();
        let inner = match token.strip_prefix('[') {
            Some(rest) => rest.strip_suffix(']')?,
            None => token,
        };
        all_consuming(time_range)(inner.trim())
            .ok()
            .map(|(_, range)| range)
    }

    pub fn parse_clock_time(token: &str) -> Option<ClockTime> {
        all_consuming(clock_time)(token.trim())
            .ok()
            .map(|(_, time)| time)
    }

    /// Leading unbracketed time token followed by whitespace or end of text.
    pub fn leading_time_range(text: &str) -> Option<(TimeRange, &str)> {
        terminated(time_range, alt((space1, eof)))(text)
            .ok()
            .map(|(rest, range)| (range, rest))
    }

    /// Splits a leading `[...]` slot whose contents look like a time token.
    ///
    /// Returns `(inner, rest)`. Brackets holding words, or forming a markdown
    /// link (`[text](url)`, `[text][ref]`), are not time slots.
    pub fn bracketed_time_slot(text: &str) -> Option<(&str, &str)> {
        let after_open = text.strip_prefix('[')?;
        let close = after_open.find(']')?;
        let (inner, rest) = (&after_open[..close], &after_open[close + 1..]);
        if rest.starts_with('(') || rest.starts_with('[') {
            return None;
        }
        let time_like = !inner.trim().is_empty()
            && inner
                .chars()
                .all(|c| c.is_ascii_digit() || matches!(c, ':' | '-' | '–' | '~' | ' '));
        time_like.then_some((inner, rest))
    }

    /// Strict `YYYY-MM-DD` that must also be a real calendar date.
    pub fn parse_iso_date(text: &str) -> Option<NaiveDate> {
        all_consuming(iso_date)(text.trim())
            .ok()
            .map(|(_, date)| date)
    }

    /// Shape check only: four digits, dash, two digits, dash, two digits.
    pub fn is_iso_date_pattern(text: &str) -> bool {
        all_consuming(date_parts)(text).is_ok()
    }

    /// First `YYYY-MM-DD` in `text` not glued to other digits.
    pub fn find_iso_date(text: &str) -> Option<NaiveDate> {
        text.char_indices()
            .filter(|&(idx, c)| {
                c.is_ascii_digit() && !text[..idx].ends_with(|p: char| p.is_ascii_digit())
            })
            .find_map(|(idx, _)| match iso_date(&text[idx..]) {
                Ok((rest, date)) if !rest.starts_with(|c: char| c.is_ascii_digit()) => Some(date),
                _ => None,
            })
    }

    fn time_range(i: &str) -> PResult<'_, TimeRange> {
        let (i, start) = clock_time(i)?;
        let (i, end) = opt(preceded(range_separator, clock_time))(i)?;
        Ok((i, TimeRange { start, end }))
    }

    fn range_separator(i: &str) -> PResult<'_, char> {
        delimited(space0, one_of("-–~"), space0)(i)
    }

    fn clock_time(i: &str) -> PResult<'_, ClockTime> {
        map_opt(
            separated_pair(two_digits::<u8>, char(':'), two_digits::<u8>),
            |(hour, minute)| ClockTime::new(hour, minute),
        )(i)
    }

    fn iso_date(i: &str) -> PResult<'_, NaiveDate> {
        map_opt(date_parts, |(year, month, day)| {
            NaiveDate::from_ymd_opt(year, month, day)
        })(i)
    }

    fn date_parts(i: &str) -> PResult<'_, (i32, u32, u32)> {
        let (i, (year, _, month, _, day)) = tuple((
            map_res(take_while_m_n(4, 4, char_is_digit), |s: &str| {
                s.parse::<i32>()
            }),
            char('-'),
            two_digits::<u32>,
            char('-'),
            two_digits::<u32>,
        ))(i)?;
        Ok((i, (year, month, day)))
    }

    fn two_digits<T: std::str::FromStr>(i: &str) -> PResult<'_, T> {
        map_res(take_while_m_n(2, 2, char_is_digit), |s: &str| s.parse::<T>())(i)
    }

    fn char_is_digit(c: char) -> bool {
        c.is_ascii_digit()
    }

}

pub mod tags {
    //! Inline `#tag` extraction.

    use crate::config::TagSyntax;
    use crate::core::Tag;
    use log::debug;
    use std::collections::BTreeSet;

    /// Text with its tags removed, plus the tags.
    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct TagSplit {
        /// Remaining words in order, single-space separated.
        pub text: String,
        pub tags: BTreeSet<Tag>,
    }

    pub fn extract_tags(text: &str) -> TagSplit {
        extract_tags_with(text, &TagSyntax::default())
    }

    pub fn extract_tags_with(text: &str, syntax: &TagSyntax) -> TagSplit {
        let mut tags = BTreeSet::new();
        let mut words: Vec<String> = Vec::new();
        for word in text.split_whitespace() {
            let Some((prefix, name, suffix)) = tag_token(word, syntax) else {
                if word.len() > 1 && word.starts_with('#') {
                    debug!("keeping malformed tag token {:?} as text", word);
                }
                words.push(word.to_string());
                continue;
            };
            tags.insert(Tag::from(name));
            let leftover = format!("{prefix}{suffix}");
            if leftover.is_empty() || EMPTY_PAIRS.contains(&leftover.as_str()) {
                continue;
            }
            // `#work,` leaves the comma on the word before it
            match words.last_mut() {
                Some(last) if prefix.is_empty() => last.push_str(suffix),
                _ => words.push(leftover),
            }
        }
        TagSplit {
            text: words.join(" "),
            tags,
        }
    }

    const OPENERS: &[char] = &['(', '[', '{', '"', '\''];
    const CLOSERS: &[char] = &[')', ']', '}', '"', '\'', ',', '.', ';', ':', '!', '?'];
    const EMPTY_PAIRS: &[&str] = &["()", "[]", "{}", "\"\"", "''"];

    /// `#name` as a word, optionally wrapped in punctuation (`(#work)`,
    /// `#work,`). Returns `(prefix, name, suffix)`.
    pub fn tag_token<'a>(
        word: &'a str,
        syntax: &TagSyntax,
    ) -> Option<(&'a str, &'a str, &'a str)> {
        let body = word.trim_start_matches(OPENERS);
        let prefix = &word[..word.len() - body.len()];
        let rest = body.strip_prefix('#')?;
        let end = rest
            .char_indices()
            .find(|&(_, c)| !syntax.is_tag_char(c))
            .map_or(rest.len(), |(idx, _)| idx);
        let (name, suffix) = rest.split_at(end);
        (!name.is_empty() && suffix.chars().all(|c| CLOSERS.contains(&c)))
            .then_some((prefix, name, suffix))
    }

    /// Tag name from a metadata list; a single leading `#` is tolerated.
    pub fn normalize_tag(raw: &str, syntax: &TagSyntax) -> Option<Tag> {
        let raw = raw.trim();
        let name = raw.strip_prefix('#').unwrap_or(raw);
        syntax.is_valid_name(name).then(|| Tag::from(name))
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn names(split: &TagSplit) -> Vec<&str> {
            split.tags.iter().map(Tag::as_str).collect()
        }

        #[test]
        fn strips_tags_and_collapses_whitespace() {
            let split = extract_tags("  Team   standup #work  notes #sync ");
            assert_eq!(split.text, "Team standup notes");
            assert_eq!(names(&split), ["sync", "work"]);
        }

        #[test]
        fn duplicates_collapse() {
            let split = extract_tags("#a x #a #b");
            assert_eq!(split.text, "x");
            assert_eq!(names(&split), ["a", "b"]);
        }

        #[test]
        fn no_tags_is_empty_not_error() {
            let split = extract_tags("Plain text");
            assert_eq!(split.text, "Plain text");
            assert!(split.tags.is_empty());
            assert_eq!(extract_tags(""), TagSplit::default());
        }

        #[test]
        fn malformed_tokens_stay_in_text() {
            let split = extract_tags("Fix issue#12 # hash #a.b ##double #ok");
            assert_eq!(split.text, "Fix issue#12 # hash #a.b ##double");
            assert_eq!(names(&split), ["ok"]);
        }

        #[test]
        fn punctuation_around_a_tag_is_left_in_text() {
            let split = extract_tags("Meeting #work, then lunch (#social)");
            assert_eq!(split.text, "Meeting, then lunch");
            assert_eq!(names(&split), ["social", "work"]);

            let split = extract_tags("Done #shipped! \"#quoted\" ok");
            assert_eq!(split.text, "Done! ok");
            assert_eq!(names(&split), ["quoted", "shipped"]);

            let leading = extract_tags("#urgent: call back");
            assert_eq!(leading.text, ": call back");
            assert_eq!(names(&leading), ["urgent"]);
        }

        #[test]
        fn syntax_is_configurable() {
            let text = "会議 #仕事 #deep-work";
            assert_eq!(names(&extract_tags(text)), ["deep-work", "仕事"]);

            let ascii = extract_tags_with(text, &TagSyntax::ascii());
            assert_eq!(ascii.text, "会議 #仕事");
            assert_eq!(names(&ascii), ["deep-work"]);
        }

        #[test]
        fn metadata_tags_normalize() {
            let syntax = TagSyntax::default();
            assert_eq!(normalize_tag(" #work ", &syntax), Some(Tag::from("work")));
            assert_eq!(normalize_tag("deep work", &syntax), None);
            assert_eq!(normalize_tag("#", &syntax), None);
        }
    }
}

pub mod event {
    //! Event notes.
    //!
    //! ```text
    //! ---
    //! start: 2025-01-31
    //! end: 2025-02-01        # optional, defaults to start
    //! time: 09:00-10:00      # or {start: "09:00", end: "10:00"}
    //! tags: [work, travel]
    //! location: Osaka
    //! ---
    //! # Title
    //! Free prose body.
    //! ```
    //!
    //! A document without a parsable `start`, with an unterminated metadata
    //! block, or without any title yields `None`. Malformed optional fields
    //! are dropped individually and the rest of the note still parses.

    use crate::config::{ParseOptions, TagSyntax};
    use crate::core::{EventMetadata, EventNote, Tag, TimeRange};
    use crate::scan::{Line, classify_line, split_metadata};
    use crate::tags::normalize_tag;
    use crate::time::{parse_clock_time, parse_iso_date, parse_time_range};
    use chrono::NaiveDate;
    use log::debug;
    use serde_yaml::{Mapping, Value};
    use std::collections::BTreeSet;

    pub fn parse_event_note(input: &str) -> Option<EventNote> {
        parse_event_note_with(input, &ParseOptions::default())
    }

    pub fn parse_event_note_with(input: &str, options: &ParseOptions) -> Option<EventNote> {
        let doc = split_metadata(input)?;
        let Some(raw) = doc.metadata else {
            debug!("event note has no metadata block");
            return None;
        };
        let mapping = match serde_yaml::from_str::<Value>(raw) {
            Ok(Value::Mapping(mapping)) => mapping,
            Ok(Value::Null) => Mapping::new(),
            Ok(other) => {
                debug!("metadata block is not a mapping: {:?}", other);
                return None;
            }
            Err(err) => {
                debug!("metadata block is not valid YAML: {err}");
                return None;
            }
        };
        let fields = read_fields(&mapping, options);

        let Some(start) = fields.start.or(fields.date) else {
            debug!("event note has no usable start date");
            return None;
        };
        let end = match fields.end {
            EndField::Missing => start,
            EndField::Date(end) => end,
            EndField::Malformed => {
                debug!("falling back to start date for malformed end");
                start
            }
        };
        if end < start {
            debug!("event ends ({end}) before it starts ({start})");
            return None;
        }

        let (heading, body) = title_and_body(doc.body);
        let Some(title) = heading.or(fields.title) else {
            debug!("event note has neither a heading nor a title field");
            return None;
        };

        let all_day = fields.all_day.unwrap_or(fields.time.is_none());
        let time = if all_day {
            if fields.time.is_some() {
                debug!("dropping time range on an all-day event");
            }
            None
        } else {
            fields.time
        };

        Some(EventNote {
            title,
            start,
            end,
            all_day,
            time,
            tags: fields.tags,
            body,
            metadata: (!fields.metadata.is_empty()).then_some(fields.metadata),
        })
    }

    #[derive(Debug, Default)]
    struct Fields {
        start: Option<NaiveDate>,
        date: Option<NaiveDate>,
        end: EndField,
        time: Option<TimeRange>,
        all_day: Option<bool>,
        title: Option<String>,
        tags: BTreeSet<Tag>,
        metadata: EventMetadata,
    }

    #[derive(Debug, Default)]
    enum EndField {
        #[default]
        Missing,
        Date(NaiveDate),
        Malformed,
    }

    fn read_fields(mapping: &Mapping, options: &ParseOptions) -> Fields {
        let mut fields = Fields::default();
        for (key, value) in mapping {
            let Some(key) = key.as_str() else {
                debug!("ignoring non-string metadata key {:?}", key);
                continue;
            };
            match key {
                "start" => fields.start = date_field(key, value),
                "date" => fields.date = date_field(key, value),
                "end" => {
                    fields.end = match value {
                        Value::Null => EndField::Missing,
                        other => date_field(key, other).map_or(EndField::Malformed, EndField::Date),
                    }
                }
                "time" => fields.time = time_field(value),
                "allDay" | "all_day" => {
                    fields.all_day = value.as_bool();
                    if fields.all_day.is_none() {
                        debug!("ignoring non-boolean `{key}`: {:?}", value);
                    }
                }
                "title" => {
                    fields.title = scalar_string(value)
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                }
                "tags" => fields.tags = tags_field(value, &options.tag_syntax),
                "location" => fields.metadata.location = scalar_string(value),
                "memo" => fields.metadata.memo = scalar_string(value),
                "url" => fields.metadata.url = scalar_string(value),
                other => match scalar_string(value) {
                    Some(text) => {
                        fields.metadata.extra.insert(other.to_string(), text);
                    }
                    None => debug!("ignoring non-scalar metadata field `{other}`"),
                },
            }
        }
        fields
    }

    fn scalar_string(value: &Value) -> Option<String> {
        match value {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    fn date_field(name: &str, value: &Value) -> Option<NaiveDate> {
        let date = scalar_string(value).as_deref().and_then(parse_iso_date);
        if date.is_none() {
            debug!("metadata field `{name}` is not a YYYY-MM-DD date: {:?}", value);
        }
        date
    }

    fn time_field(value: &Value) -> Option<TimeRange> {
        let range = match value {
            Value::String(s) => parse_time_range(s),
            Value::Mapping(map) => time_mapping(map),
            _ => None,
        };
        if range.is_none() {
            debug!("dropping malformed time field: {:?}", value);
        }
        range
    }

    fn time_mapping(map: &Mapping) -> Option<TimeRange> {
        let start = map
            .get("start")
            .and_then(Value::as_str)
            .and_then(parse_clock_time)?;
        let end = match map.get("end") {
            None | Some(Value::Null) => None,
            Some(value) => Some(value.as_str().and_then(parse_clock_time)?),
        };
        Some(TimeRange { start, end })
    }

    fn tags_field(value: &Value, syntax: &TagSyntax) -> BTreeSet<Tag> {
        let names: Vec<String> = match value {
            Value::Sequence(items) => items.iter().filter_map(scalar_string).collect(),
            Value::String(s) => s
                .split(|c: char| c == ',' || c.is_whitespace())
                .map(str::to_string)
                .collect(),
            Value::Null => Vec::new(),
            other => {
                debug!("ignoring tags field of unexpected shape: {:?}", other);
                Vec::new()
            }
        };
        names
            .iter()
            .filter(|name| !name.trim().is_empty())
            .filter_map(|name| {
                let tag = normalize_tag(name, syntax);
                if tag.is_none() {
                    debug!("skipping invalid tag {:?}", name);
                }
                tag
            })
            .collect()
    }

    /// First heading is the title; everything after it is the body.
    fn title_and_body(body: &str) -> (Option<String>, Option<String>) {
        let mut offset = 0;
        for line in body.split_inclusive('\n') {
            offset += line.len();
            if let Line::Heading { text, .. } = classify_line(line) {
                let title = (!text.is_empty()).then(|| text.to_string());
                return (title, trimmed_body(&body[offset..]));
            }
        }
        (None, trimmed_body(body))
    }

    /// Leading blank lines and trailing whitespace removed; `None` if nothing is left.
    fn trimmed_body(text: &str) -> Option<String> {
        let mut rest = text;
        while let Some(pos) = rest.find('\n') {
            if rest[..pos].trim().is_empty() {
                rest = &rest[pos + 1..];
            } else {
                break;
            }
        }
        let rest = rest.trim_end();
        (!rest.trim().is_empty()).then(|| rest.to_string())
    }

}

pub mod daily {
    //! Daily notes: a date heading and one bullet per entry.
    //!
    //! ```text
    //! # 2025-01-15
    //! - [09:00-10:00] Team standup #work
    //! - [x] [12:00] Lunch with Mika #social
    //! - Buy milk
    //! ```
    //!
    //! Bullet syntax: optional checkbox, optional time token (bracketed, or a
    //! bare token that parses completely), then title words and `#tags`.
    //! A bracketed token that is not a valid time is dropped and the entry
    //! keeps no time. A backslash before the title (`- \12:00 is a label`)
    //! stops checkbox and time detection. Non-bullet lines and headings after
    //! the first are ignored.

    use crate::config::ParseOptions;
    use crate::core::{Checkbox, DailyNote, Entry, TimeRange};
    use crate::scan::{Line, classify_line, split_metadata};
    use crate::tags::{TagSplit, extract_tags_with};
    use crate::time::{bracketed_time_slot, find_iso_date, leading_time_range, parse_time_range};
    use log::debug;
    use nom::{
        IResult,
        branch::alt,
        character::complete::{char, one_of, space1},
        combinator::{eof, map},
        error::VerboseError,
        sequence::{delimited, terminated},
    };

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    pub fn parse_daily_note(input: &str) -> Option<DailyNote> {
        parse_daily_note_with(input, &ParseOptions::default())
    }

    pub fn parse_daily_note_with(input: &str, options: &ParseOptions) -> Option<DailyNote> {
        let body = split_metadata(input).map_or(input, |doc| doc.body);
        let mut lines = body.lines().map(classify_line);

        let heading = lines.by_ref().find_map(|line| match line {
            Line::Heading { text, .. } => Some(text),
            _ => None,
        });
        let Some(heading) = heading else {
            debug!("daily note has no heading");
            return None;
        };
        let Some(date) = find_iso_date(heading) else {
            debug!("daily note heading {:?} carries no date", heading);
            return None;
        };

        let entries = lines
            .filter_map(|line| match line {
                Line::Bullet { text, .. } => parse_entry(text, options),
                _ => None,
            })
            .collect();

        Some(DailyNote { date, entries })
    }

    /// One bullet's text (marker already removed) as an entry.
    pub fn parse_entry(text: &str, options: &ParseOptions) -> Option<Entry> {
        let (checkbox, rest) = match checkbox(text) {
            Ok((rest, state)) => (Some(state), rest),
            Err(_) => (None, text),
        };
        let (time, rest) = if rest.starts_with(ESCAPE) {
            (None, rest)
        } else {
            split_time(rest)
        };
        let rest = rest.trim_start();
        let rest = rest.strip_prefix(ESCAPE).unwrap_or(rest);
        let TagSplit { text: title, tags } = extract_tags_with(rest, &options.tag_syntax);

        if title.is_empty() && time.is_none() && tags.is_empty() && checkbox.is_none() {
            debug!("skipping empty bullet");
            return None;
        }
        Some(Entry {
            title,
            time,
            tags,
            checkbox,
        })
    }

    /// A leading backslash marks the rest of a bullet as literal title text.
    pub const ESCAPE: char = '\\';

    /// Whether `entry.title`, written after the entry's checkbox and time,
    /// would be read back as a checkbox or time token (or lose an escape).
    pub fn title_needs_escape(entry: &Entry) -> bool {
        let title = entry.title.as_str();
        if title.starts_with(ESCAPE) {
            return true;
        }
        if entry.time.is_some() {
            return false;
        }
        let reads_as_time =
            bracketed_time_slot(title).is_some() || leading_time_range(title).is_some();
        let reads_as_checkbox = entry.checkbox.is_none() && checkbox(title).is_ok();
        reads_as_time || reads_as_checkbox
    }

    fn split_time(text: &str) -> (Option<TimeRange>, &str) {
        if let Some((inner, rest)) = bracketed_time_slot(text) {
            let time = parse_time_range(inner);
            if time.is_none() {
                debug!("entry time token [{inner}] is not a valid time");
            }
            return (time, rest);
        }
        match leading_time_range(text) {
            Some((time, rest)) => (Some(time), rest),
            None => (None, text),
        }
    }

    fn checkbox(i: &str) -> PResult<'_, Checkbox> {
        terminated(
            delimited(
                char('['),
                alt((
                    map(char(' '), |_| Checkbox::Empty),
                    map(one_of("xX"), |_| Checkbox::Checked),
                )),
                char(']'),
            ),
            alt((space1, eof)),
        )(i)
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::core::{ClockTime, Tag};

        fn t(h: u8, m: u8) -> ClockTime {
            ClockTime::new(h, m).unwrap()
        }

        fn tag_names(entry: &Entry) -> Vec<&str> {
            entry.tags.iter().map(Tag::as_str).collect()
        }

        #[test]
        fn standup_bullet() {
            let note =
                parse_daily_note("# 2025-01-15\n- [09:00-10:00] Team standup #work\n").unwrap();
            assert_eq!(note.date.to_string(), "2025-01-15");
            let entry = &note.entries[0];
            assert_eq!(entry.title, "Team standup");
            assert_eq!(entry.time, Some(TimeRange::span(t(9, 0), t(10, 0))));
            assert_eq!(tag_names(entry), ["work"]);
            assert_eq!(entry.checkbox, None);
        }

        #[test]
        fn entries_keep_source_order_and_skip_noise() {
            let input = "\
Some preamble
# 2025-01-15 (Wed)

- [08:00] Gym #health
Random prose line

- Buy milk
## Afternoon
* [14:00-15:00] Review #work #team
  + nested note
";
            let note = parse_daily_note(input).unwrap();
            let titles: Vec<_> = note.entries.iter().map(|e| e.title.as_str()).collect();
            assert_eq!(titles, ["Gym", "Buy milk", "Review", "nested note"]);
            assert_eq!(tag_names(&note.entries[2]), ["team", "work"]);
            assert_eq!(note.entries[1].time, None);
        }

        #[test]
        fn bad_time_token_keeps_entry_without_time() {
            let note = parse_daily_note("# 2025-01-15\n- [25:00] Late call #work\n").unwrap();
            assert_eq!(note.entries.len(), 1);
            assert_eq!(note.entries[0].title, "Late call");
            assert_eq!(note.entries[0].time, None);
            assert_eq!(tag_names(&note.entries[0]), ["work"]);
        }

        #[test]
        fn non_time_brackets_stay_in_title() {
            let note = parse_daily_note("# 2025-01-15\n- [Docs](http://x) review\n").unwrap();
            assert_eq!(note.entries[0].title, "[Docs](http://x) review");
            assert_eq!(note.entries[0].time, None);
        }

        #[test]
        fn checkboxes_and_bare_times() {
            let note = parse_daily_note(
                "# 2025-01-15\n- [ ] Call bank\n- [x] [12:00] Lunch #social\n- 07:30 Run\n",
            )
            .unwrap();
            assert_eq!(note.entries[0].checkbox, Some(Checkbox::Empty));
            assert_eq!(note.entries[0].title, "Call bank");
            assert_eq!(note.entries[1].checkbox, Some(Checkbox::Checked));
            assert_eq!(note.entries[1].time, Some(TimeRange::point(t(12, 0))));
            assert_eq!(note.entries[2].time, Some(TimeRange::point(t(7, 30))));
            assert_eq!(note.entries[2].title, "Run");
        }

        #[test]
        fn escaped_title_is_taken_literally() {
            let options = ParseOptions::default();
            let entry = parse_entry("\\12:00 standup #work", &options).unwrap();
            assert_eq!(entry.title, "12:00 standup");
            assert_eq!(entry.time, None);
            assert_eq!(tag_names(&entry), ["work"]);

            let entry = parse_entry("[x] \\[09:00] is a label", &options).unwrap();
            assert_eq!(entry.checkbox, Some(Checkbox::Checked));
            assert_eq!(entry.time, None);
            assert_eq!(entry.title, "[09:00] is a label");

            let entry = parse_entry("[10:00] \\\\server path", &options).unwrap();
            assert_eq!(entry.time, Some(TimeRange::point(t(10, 0))));
            assert_eq!(entry.title, "\\server path");
        }

        #[test]
        fn escape_is_needed_only_for_ambiguous_titles() {
            let entry = |title: &str, time, checkbox| Entry {
                title: title.to_string(),
                time,
                tags: Default::default(),
                checkbox,
            };
            let nine = Some(TimeRange::point(t(9, 0)));
            assert!(title_needs_escape(&entry("12:00 standup", None, None)));
            assert!(title_needs_escape(&entry("[25:00] late", None, None)));
            assert!(title_needs_escape(&entry("[x] done", None, None)));
            assert!(title_needs_escape(&entry("\\path", nine, None)));
            assert!(!title_needs_escape(&entry("12:00 standup", nine, None)));
            assert!(!title_needs_escape(&entry("[x] done", None, Some(Checkbox::Empty))));
            assert!(!title_needs_escape(&entry("[Docs](http://x) review", None, None)));
        }

        #[test]
        fn empty_bullets_are_skipped() {
            let note = parse_daily_note("# 2025-01-15\n-\n- \n- Real\n").unwrap();
            assert_eq!(note.entries.len(), 1);
        }

        #[test]
        fn missing_or_dateless_heading_is_none() {
            assert_eq!(parse_daily_note("- [09:00] Orphan\n"), None);
            assert_eq!(parse_daily_note("# Groceries\n- milk\n"), None);
            assert_eq!(parse_daily_note(""), None);
        }

        #[test]
        fn leading_metadata_block_is_skipped() {
            let note =
                parse_daily_note("---\n# yaml comment\nmood: ok\n---\n# 2025-01-16\n- Walk\n")
                    .unwrap();
            assert_eq!(note.date.to_string(), "2025-01-16");
            assert_eq!(note.entries.len(), 1);
        }

        #[test]
        fn n_bullets_give_n_entries() {
            let bullets: Vec<String> = (0..12).map(|i| format!("- [{:02}:00] item {i}", i + 8)).collect();
            let input = format!("# 2025-01-15\n{}\n", bullets.join("\n"));
            let note = parse_daily_note(&input).unwrap();
            assert_eq!(note.entries.len(), 12);
            for (i, entry) in note.entries.iter().enumerate() {
                assert_eq!(entry.title, format!("item {i}"));
            }
        }

        #[test]
        fn parsing_is_idempotent() {
            let input = "# 2025-01-15\n- [09:00] A #x\n- B\n";
            assert_eq!(parse_daily_note(input), parse_daily_note(input));
        }
    }
}

pub mod schema {
    //! Re-validation of event form records that did not come from the parser.
    //!
    //! Validation is total: every failure is reported as a [`FieldIssue`] so a
    //! form can highlight fields; nothing here panics on user input.

    use crate::core::EventNote;
    use crate::time::is_iso_date_pattern;
    use serde::{Deserialize, Serialize};
    use serde_json::Value;
    use std::fmt;

    /// `{ title, start, end, allDay }` as edited in a form. An empty `end`
    /// means "not chosen yet".
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct EventForm {
        pub title: String,
        pub start: String,
        #[serde(default)]
        pub end: String,
        pub all_day: bool,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub enum FormField {
        Title,
        Start,
        End,
        AllDay,
    }

    impl fmt::Display for FormField {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(match self {
                FormField::Title => "title",
                FormField::Start => "start",
                FormField::End => "end",
                FormField::AllDay => "allDay",
            })
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
    #[serde(tag = "kind", rename_all = "camelCase")]
    pub enum IssueKind {
        #[error("is required")]
        Missing,
        #[error("must be a {expected}")]
        WrongType { expected: &'static str },
        #[error("must be a date in YYYY-MM-DD form")]
        InvalidDate,
        #[error("must not precede the start date")]
        EndBeforeStart,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
    #[error("{field} {kind}")]
    pub struct FieldIssue {
        pub field: FormField,
        pub kind: IssueKind,
    }

    impl FieldIssue {
        fn new(field: FormField, kind: IssueKind) -> Self {
            Self { field, kind }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
    #[error("{}", join_issues(.0))]
    pub struct ValidationErrors(pub Vec<FieldIssue>);

    impl ValidationErrors {
        pub fn issues(&self) -> &[FieldIssue] {
            &self.0
        }

        pub fn has_issue_for(&self, field: FormField) -> bool {
            self.0.iter().any(|issue| issue.field == field)
        }
    }

    fn join_issues(issues: &[FieldIssue]) -> String {
        issues
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }

    impl EventForm {
        /// Field-level problems; empty when the form is acceptable.
        pub fn issues(&self) -> Vec<FieldIssue> {
            let mut issues = Vec::new();
            let start_ok = is_iso_date_pattern(&self.start);
            if self.start.is_empty() {
                issues.push(FieldIssue::new(FormField::Start, IssueKind::Missing));
            } else if !start_ok {
                issues.push(FieldIssue::new(FormField::Start, IssueKind::InvalidDate));
            }
            if !self.end.is_empty() {
                if !is_iso_date_pattern(&self.end) {
                    issues.push(FieldIssue::new(FormField::End, IssueKind::InvalidDate));
                } else if start_ok && self.end < self.start {
                    // zero-padded ISO dates order lexicographically
                    issues.push(FieldIssue::new(FormField::End, IssueKind::EndBeforeStart));
                }
            }
            issues
        }

        pub fn validate(self) -> Result<EventForm, ValidationErrors> {
            let issues = self.issues();
            if issues.is_empty() {
                Ok(self)
            } else {
                Err(ValidationErrors(issues))
            }
        }
    }

    impl From<&EventNote> for EventForm {
        fn from(note: &EventNote) -> Self {
            Self {
                title: note.title.clone(),
                start: note.start.to_string(),
                end: note.end.to_string(),
                all_day: note.all_day,
            }
        }
    }

    /// Validates an untyped record (fixture, form state, API payload).
    ///
    /// Type errors and format errors are collected together; an absent `end`
    /// counts as the empty string.
    pub fn validate_record(record: &Value) -> Result<EventForm, ValidationErrors> {
        let empty = serde_json::Map::new();
        let object = record.as_object().unwrap_or(&empty);
        let mut issues = Vec::new();

        let title = string_field(object, "title", FormField::Title, &mut issues);
        let start = string_field(object, "start", FormField::Start, &mut issues);
        let end = match object.get("end") {
            None | Some(Value::Null) => Some(String::new()),
            Some(_) => string_field(object, "end", FormField::End, &mut issues),
        };
        let all_day = match object.get("allDay") {
            Some(Value::Bool(b)) => Some(*b),
            None | Some(Value::Null) => {
                issues.push(FieldIssue::new(FormField::AllDay, IssueKind::Missing));
                None
            }
            Some(_) => {
                issues.push(FieldIssue::new(
                    FormField::AllDay,
                    IssueKind::WrongType {
                        expected: "boolean",
                    },
                ));
                None
            }
        };

        match (title, start, end, all_day) {
            (Some(title), Some(start), Some(end), Some(all_day)) if issues.is_empty() => EventForm {
                title,
                start,
                end,
                all_day,
            }
            .validate(),
            (_, start, end, _) => {
                // still report format problems of the fields that were strings
                let partial = EventForm {
                    title: String::new(),
                    start: start.unwrap_or_else(|| "-".to_string()),
                    end: end.unwrap_or_default(),
                    all_day: false,
                };
                let format_issues: Vec<_> = partial
                    .issues()
                    .into_iter()
                    .filter(|issue| !issues.iter().any(|seen| seen.field == issue.field))
                    .collect();
                issues.extend(format_issues);
                Err(ValidationErrors(issues))
            }
        }
    }

    fn string_field(
        object: &serde_json::Map<String, Value>,
        key: &str,
        field: FormField,
        issues: &mut Vec<FieldIssue>,
    ) -> Option<String> {
        match object.get(key) {
            Some(Value::String(s)) => Some(s.clone()),
            None | Some(Value::Null) => {
                issues.push(FieldIssue::new(field, IssueKind::Missing));
                None
            }
            Some(_) => {
                issues.push(FieldIssue::new(
                    field,
                    IssueKind::WrongType { expected: "string" },
                ));
                None
            }
        }
    }

}

pub mod category {
    //! Tag → display color lookup.
    //!
    //! One registry is built at startup and handed by reference to everything
    //! that renders tags. Writes are last-write-wins per tag; readers never
    //! block each other.

    use log::debug;
    use std::{
        collections::HashMap,
        sync::{PoisonError, RwLock},
    };

    #[derive(Debug, Default)]
    pub struct CategoryRegistry {
        colors: RwLock<HashMap<String, String>>,
    }

    impl CategoryRegistry {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn from_palette<I, K, V>(palette: I) -> Self
        where
            I: IntoIterator<Item = (K, V)>,
            K: Into<String>,
            V: Into<String>,
        {
            let registry = Self::new();
            for (tag, color) in palette {
                registry.set(tag, color);
            }
            registry
        }

        /// Inserts or overwrites the color for `tag`.
        pub fn set(&self, tag: impl Into<String>, color: impl Into<String>) {
            let (tag, color) = (tag.into(), color.into());
            if !is_hex_color(&color) {
                debug!("category {:?} registered with non-hex color {:?}", tag, color);
            }
            self.colors
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(tag, color);
        }

        pub fn get(&self, tag: &str) -> Option<String> {
            self.colors
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(tag)
                .cloned()
        }

        /// Registered color, or `fallback` for unknown tags.
        pub fn get_or(&self, tag: &str, fallback: &str) -> String {
            self.get(tag).unwrap_or_else(|| fallback.to_string())
        }

        /// Snapshot of all registrations, in no particular order.
        pub fn entries(&self) -> Vec<(String, String)> {
            self.colors
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .map(|(tag, color)| (tag.clone(), color.clone()))
                .collect()
        }

        pub fn len(&self) -> usize {
            self.colors
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .len()
        }

        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }
    }

    /// `#RGB`, `#RRGGBB` or `#RRGGBBAA`.
    pub fn is_hex_color(color: &str) -> bool {
        color.strip_prefix('#').is_some_and(|hex| {
            matches!(hex.len(), 3 | 6 | 8) && hex.chars().all(|c| c.is_ascii_hexdigit())
        })
    }

}

pub mod format {
    //! Render notes back to their markdown forms.
    //!
    //! Output is canonical: metadata keys in a fixed order, strings quoted,
    //! tags after the title. Parsing the output gives back an equal note.
    //! [`format_daily_source`] is the in-place variant: it rewrites entry
    //! bullets and leaves every other line as written.

    use crate::config::ParseOptions;
    use crate::core::*;
    use crate::daily::{ESCAPE, parse_daily_note_with, parse_entry, title_needs_escape};
    use crate::scan::{Line, classify_line, split_metadata};
    use std::fmt::Write;

    pub fn format_event_note(note: &EventNote) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "---");
        let _ = writeln!(out, "start: {}", note.start);
        if note.end != note.start {
            let _ = writeln!(out, "end: {}", note.end);
        }
        if note.all_day != note.time.is_none() {
            let _ = writeln!(out, "allDay: {}", note.all_day);
        }
        if let Some(time) = &note.time {
            let _ = writeln!(out, "time: \"{time}\"");
        }
        if !note.tags.is_empty() {
            let tags = note
                .tags
                .iter()
                .map(|tag| quote(tag.as_str()))
                .collect::<Vec<_>>()
                .join(", ");
            let _ = writeln!(out, "tags: [{tags}]");
        }
        if let Some(meta) = &note.metadata {
            for (key, value) in meta.fields() {
                let _ = writeln!(out, "{}: {}", yaml_key(key), quote(value));
            }
        }
        let _ = writeln!(out, "---");
        let _ = writeln!(out);
        // a trailing `#` run would otherwise read as a closing sequence
        let closing = if note.title.ends_with('#') { " #" } else { "" };
        let _ = writeln!(out, "# {}{closing}", note.title);
        if let Some(body) = &note.body {
            let _ = writeln!(out);
            let _ = writeln!(out, "{body}");
        }
        out
    }

    pub fn format_daily_note(note: &DailyNote) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# {}", note.date);
        if !note.entries.is_empty() {
            let _ = writeln!(out);
        }
        for entry in &note.entries {
            let _ = writeln!(out, "- {}", render_entry(entry));
        }
        out
    }

    /// Daily note source with each entry bullet rewritten in canonical form.
    ///
    /// Indentation, bullet markers, line endings, the heading and all
    /// non-entry lines are kept. `None` when `input` is not a daily note.
    pub fn format_daily_source(input: &str, options: &ParseOptions) -> Option<String> {
        parse_daily_note_with(input, options)?;
        let body_start = split_metadata(input).map_or(0, |doc| input.len() - doc.body.len());

        let mut out = String::with_capacity(input.len());
        let mut offset = 0;
        let mut in_entries = false;
        for raw in input.split_inclusive('\n') {
            let line_start = offset;
            offset += raw.len();
            if line_start < body_start {
                out.push_str(raw);
                continue;
            }
            match classify_line(raw) {
                Line::Heading { .. } => {
                    in_entries = true;
                    out.push_str(raw);
                }
                Line::Bullet { indent, text } if in_entries => match parse_entry(text, options) {
                    Some(entry) => {
                        let line = raw.trim_end_matches(['\r', '\n']);
                        let (lead, marker) = (&line[..indent], &line[indent..indent + 1]);
                        let ending = &raw[line.len()..];
                        let _ = write!(out, "{lead}{marker} {}{ending}", render_entry(&entry));
                    }
                    None => out.push_str(raw),
                },
                _ => out.push_str(raw),
            }
        }
        Some(out)
    }

    fn render_entry(entry: &Entry) -> String {
        let mut parts = Vec::new();
        match entry.checkbox {
            Some(Checkbox::Empty) => parts.push("[ ]".to_string()),
            Some(Checkbox::Checked) => parts.push("[x]".to_string()),
            None => {}
        }
        if let Some(time) = &entry.time {
            parts.push(format!("[{time}]"));
        }
        if title_needs_escape(entry) {
            parts.push(format!("{ESCAPE}{}", entry.title));
        } else if !entry.title.is_empty() {
            parts.push(entry.title.clone());
        }
        parts.extend(entry.tags.iter().map(|tag| format!("#{tag}")));
        parts.join(" ")
    }

    /// JSON string literals are valid YAML double-quoted scalars.
    fn quote(value: &str) -> String {
        serde_json::to_string(value).unwrap_or_else(|_| format!("{value:?}"))
    }

    fn yaml_key(key: &str) -> String {
        if !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
        {
            key.to_string()
        } else {
            quote(key)
        }
    }

}

pub mod agenda {
    //! Agenda projection over parsed notes.

    use crate::core::*;
    use chrono::NaiveDate;
    use serde::{Deserialize, Serialize};
    use std::collections::BTreeSet;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub enum AgendaSource {
        Event,
        Daily,
    }

    /// One row of an agenda; multi-day events produce one row per day.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct AgendaItem {
        pub date: NaiveDate,
        /// Daily entries are all-day exactly when they carry no time.
        #[serde(rename = "allDay")]
        pub all_day: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub time: Option<TimeRange>,
        pub title: String,
        #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
        pub tags: BTreeSet<Tag>,
        pub source: AgendaSource,
    }

    /// Inclusive date filter; an open side is unbounded.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct AgendaRange {
        pub from: Option<NaiveDate>,
        pub to: Option<NaiveDate>,
    }

    impl AgendaRange {
        pub fn new(from: Option<NaiveDate>, to: Option<NaiveDate>) -> Self {
            Self { from, to }
        }

        pub fn contains(&self, date: NaiveDate) -> bool {
            self.from.is_none_or(|from| from <= date) && self.to.is_none_or(|to| date <= to)
        }
    }

    /// Items sorted by date, all-day rows before the rest, then start time.
    /// A non-all-day row without a time sorts ahead of timed rows. Ties keep
    /// input order (events before daily entries).
    pub fn project<'a>(
        events: impl IntoIterator<Item = &'a EventNote>,
        dailies: impl IntoIterator<Item = &'a DailyNote>,
        range: &AgendaRange,
    ) -> Vec<AgendaItem> {
        let mut items = Vec::new();

        for event in events {
            let first = range.from.map_or(event.start, |from| from.max(event.start));
            let last = range.to.map_or(event.end, |to| to.min(event.end));
            for date in first.iter_days().take_while(|day| *day <= last) {
                items.push(AgendaItem {
                    date,
                    all_day: event.all_day,
                    time: event.time,
                    title: event.title.clone(),
                    tags: event.tags.clone(),
                    source: AgendaSource::Event,
                });
            }
        }

        for daily in dailies {
            if !range.contains(daily.date) {
                continue;
            }
            items.extend(daily.entries.iter().map(|entry| AgendaItem {
                date: daily.date,
                all_day: entry.time.is_none(),
                time: entry.time,
                title: entry.title.clone(),
                tags: entry.tags.clone(),
                source: AgendaSource::Daily,
            }));
        }

        items.sort_by_key(|item| (item.date, !item.all_day, item.time.map(|time| time.start)));
        items
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::daily::parse_daily_note;
        use crate::event::parse_event_note;

        fn day(s: &str) -> NaiveDate {
            NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
        }

        #[test]
        fn merges_events_and_daily_entries() {
            let trip = parse_event_note(
                "---\nstart: 2025-01-14\nend: 2025-01-16\ntags: [travel]\n---\n# Trip\n",
            )
            .unwrap();
            let call =
                parse_event_note("---\nstart: 2025-01-15\ntime: 08:00\n---\n# Call\n").unwrap();
            let daily =
                parse_daily_note("# 2025-01-15\n- [10:00] Standup\n- [07:00] Run\n- Errands\n")
                    .unwrap();

            let range = AgendaRange::new(Some(day("2025-01-15")), Some(day("2025-01-15")));
            let items = project([&trip, &call], [&daily], &range);
            let titles: Vec<_> = items.iter().map(|i| i.title.as_str()).collect();
            assert_eq!(titles, ["Trip", "Errands", "Run", "Call", "Standup"]);
            assert!(items.iter().all(|i| i.date == day("2025-01-15")));
            assert_eq!(items[0].source, AgendaSource::Event);
        }

        #[test]
        fn untimed_event_that_is_not_all_day_follows_all_day_rows() {
            let tbd = parse_event_note("---\nstart: 2025-01-15\nallDay: false\n---\n# Slot TBD\n")
                .unwrap();
            let holiday = parse_event_note("---\nstart: 2025-01-15\n---\n# Holiday\n").unwrap();
            let daily = parse_daily_note("# 2025-01-15\n- [07:00] Run\n- Errands\n").unwrap();

            let items = project([&tbd, &holiday], [&daily], &AgendaRange::default());
            let titles: Vec<_> = items.iter().map(|i| i.title.as_str()).collect();
            assert_eq!(titles, ["Holiday", "Errands", "Slot TBD", "Run"]);
            assert!(!items[2].all_day);
            assert!(items[1].all_day);
        }

        #[test]
        fn open_range_lists_every_event_day() {
            let trip =
                parse_event_note("---\nstart: 2025-01-14\nend: 2025-01-16\n---\n# Trip\n").unwrap();
            let items = project([&trip], Vec::<&DailyNote>::new(), &AgendaRange::default());
            assert_eq!(items.len(), 3);

            let clipped = project(
                [&trip],
                [],
                &AgendaRange::new(Some(day("2025-01-16")), None),
            );
            assert_eq!(clipped.len(), 1);
            assert_eq!(clipped[0].date, day("2025-01-16"));
        }

        #[test]
        fn range_contains_is_inclusive() {
            let range = AgendaRange::new(Some(day("2025-01-01")), Some(day("2025-01-31")));
            assert!(range.contains(day("2025-01-01")));
            assert!(range.contains(day("2025-01-31")));
            assert!(!range.contains(day("2025-02-01")));
        }
    }
}

pub mod storage {
    //! File-backed note loading. Parsing stays independent of I/O.

    use crate::config::ParseOptions;
    use crate::core::{DailyNote, EventNote};
    use crate::daily::parse_daily_note_with;
    use crate::event::parse_event_note_with;
    use anyhow::{Context, Result};
    use std::{fs, path::Path};

    /// `Ok(None)` means the file was read but holds no calendar data.
    pub trait NoteLoader {
        fn load_event(&self, path: &Path) -> Result<Option<EventNote>>;
        fn load_daily(&self, path: &Path) -> Result<Option<DailyNote>>;
    }

    #[derive(Debug, Clone, Default)]
    pub struct FsNoteLoader {
        pub options: ParseOptions,
    }

    impl FsNoteLoader {
        pub fn new(options: ParseOptions) -> Self {
            Self { options }
        }

        fn read(path: &Path) -> Result<String> {
            fs::read_to_string(path).with_context(|| format!("reading {:?}", path))
        }
    }

    impl NoteLoader for FsNoteLoader {
        fn load_event(&self, path: &Path) -> Result<Option<EventNote>> {
            let text = Self::read(path)?;
            Ok(parse_event_note_with(&text, &self.options))
        }

        fn load_daily(&self, path: &Path) -> Result<Option<DailyNote>> {
            let text = Self::read(path)?;
            Ok(parse_daily_note_with(&text, &self.options))
        }
    }

}

pub use category::CategoryRegistry;
pub use config::{NotecalConfig, ParseOptions, TagSyntax};
pub use daily::{parse_daily_note, parse_daily_note_with};
pub use event::{parse_event_note, parse_event_note_with};
pub use format::{format_daily_note, format_daily_source, format_event_note};
pub use schema::{EventForm, ValidationErrors, validate_record};
pub use tags::{extract_tags, extract_tags_with};
pub use time::parse_time_range;
