//! `Expires` date parsing.
//!
//! Well-formed RFC 2822 / RFC 1123 dates go through the `time` crate's parser.
//! Everything else falls back to the lenient cookie-date algorithm of
//! RFC 6265 §5.1.1, which accepts the many historical formats servers send
//! (`Wed, 09-Jun-21 10:18:14 GMT`, asctime, missing weekday, ...).

use time::format_description::well_known::Rfc2822;
use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time};

const MONTHS: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];

/// Parses a cookie `Expires` value into epoch milliseconds.
pub fn parse_cookie_date(input: &str) -> Option<i64> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }

    if let Ok(dt) = OffsetDateTime::parse(input, &Rfc2822) {
        return Some(to_millis(dt));
    }

    parse_lenient(input)
}

fn to_millis(dt: OffsetDateTime) -> i64 {
    (dt.unix_timestamp_nanos() / 1_000_000) as i64
}

fn is_delimiter(c: char) -> bool {
    matches!(c, '\x09' | '\x20'..='\x2F' | '\x3B'..='\x40' | '\x5B'..='\x60' | '\x7B'..='\x7E')
}

/// Splits a token into its leading digits and the remainder.
fn leading_digits(token: &str) -> (&str, &str) {
    let end = token
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(token.len());
    token.split_at(end)
}

fn parse_time_token(token: &str) -> Option<(u8, u8, u8)> {
    let mut parts = [0u8; 3];
    let mut rest = token;

    for (i, part) in parts.iter_mut().enumerate() {
        let (digits, tail) = leading_digits(rest);
        if digits.is_empty() || digits.len() > 2 {
            return None;
        }
        *part = digits.parse().ok()?;

        rest = if i < 2 { tail.strip_prefix(':')? } else { tail };
    }

    Some((parts[0], parts[1], parts[2]))
}

fn parse_lenient(input: &str) -> Option<i64> {
    let mut time: Option<(u8, u8, u8)> = None;
    let mut day: Option<u8> = None;
    let mut month: Option<Month> = None;
    let mut year: Option<i32> = None;

    for token in input.split(is_delimiter).filter(|t| !t.is_empty()) {
        if time.is_none() {
            if let Some(t) = parse_time_token(token) {
                time = Some(t);
                continue;
            }
        }

        let (digits, _) = leading_digits(token);

        if day.is_none() && (1..=2).contains(&digits.len()) {
            day = digits.parse().ok();
            continue;
        }

        if month.is_none() {
            if let Some(prefix) = token.get(..3) {
                let prefix = prefix.to_ascii_lowercase();
                if let Some(idx) = MONTHS.iter().position(|m| *m == prefix) {
                    month = Month::try_from(idx as u8 + 1).ok();
                    continue;
                }
            }
        }

        if year.is_none() && (2..=4).contains(&digits.len()) {
            year = digits.parse().ok();
        }
    }

    let (hour, minute, second) = time?;
    let day = day?;
    let month = month?;
    let mut year = year?;

    if (70..=99).contains(&year) {
        year += 1900;
    } else if (0..=69).contains(&year) {
        year += 2000;
    }

    if !(1..=31).contains(&day) || year < 1601 || hour > 23 || minute > 59 || second > 59 {
        return None;
    }

    let date = Date::from_calendar_date(year, month, day).ok()?;
    let time = Time::from_hms(hour, minute, second).ok()?;

    Some(to_millis(PrimitiveDateTime::new(date, time).assume_utc()))
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2015-10-21T07:28:00Z
    const EXPECTED: i64 = 1_445_412_480_000;

    #[test]
    fn rfc1123_date() {
        assert_eq!(parse_cookie_date("Wed, 21 Oct 2015 07:28:00 GMT"), Some(EXPECTED));
    }

    #[test]
    fn rfc850_two_digit_year() {
        assert_eq!(parse_cookie_date("Wednesday, 21-Oct-15 07:28:00 GMT"), Some(EXPECTED));
    }

    #[test]
    fn asctime_date() {
        assert_eq!(parse_cookie_date("Wed Oct 21 07:28:00 2015"), Some(EXPECTED));
    }

    #[test]
    fn two_digit_year_in_last_century() {
        // 1999-01-01T00:00:00Z
        assert_eq!(
            parse_cookie_date("Fri, 01-Jan-99 00:00:00 GMT"),
            Some(915_148_800_000)
        );
    }

    #[test]
    fn garbage_is_rejected() {
        assert_eq!(parse_cookie_date(""), None);
        assert_eq!(parse_cookie_date("tomorrow"), None);
        assert_eq!(parse_cookie_date("Wed, 32 Oct 2015 07:28:00 GMT"), None);
        assert_eq!(parse_cookie_date("Wed, 21 Oct 2015 25:28:00 GMT"), None);
    }
}
