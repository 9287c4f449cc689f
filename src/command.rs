use std::sync::OnceLock;

use regex::Regex;

/// Shortest accepted schedule interval.
pub const MIN_INTERVAL_SECS: i64 = 5 * 60;
/// Longest accepted schedule interval.
pub const MAX_INTERVAL_SECS: i64 = 365 * 86_400;
/// Largest single VIP grant.
pub const MAX_VIP_DAYS: i64 = 3650;

/// A parsed `/name@via arg arg` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub name: String,
    pub via: Option<String>,
    pub args: Vec<String>,
}

pub fn parse_command(text: &str) -> Option<Command> {
    let mut words = text.split_whitespace();
    let head = words.next()?.strip_prefix('/')?;
    if head.is_empty() {
        return None;
    }

    let (name, via) = match head.split_once('@') {
        Some((name, via)) => (name, Some(via.to_string())),
        None => (head, None),
    };

    Some(Command {
        name: name.to_lowercase(),
        via,
        args: words.map(str::to_string).collect(),
    })
}

/// Parses `30m`, `6h` or `2d` into seconds.
pub fn parse_interval(text: &str) -> Option<i64> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| Regex::new(r"^(\d+)\s*(m|h|d)$").expect("interval pattern is valid"));

    let lowered = text.trim().to_lowercase();
    let caps = pattern.captures(&lowered)?;
    let value: i64 = caps[1].parse().ok()?;
    let unit = match &caps[2] {
        "m" => 60,
        "h" => 3600,
        _ => 86_400,
    };
    value.checked_mul(unit)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalError {
    Invalid,
    TooShort,
    TooLong,
}

/// A `/setfile` interval, bounded to `MIN_INTERVAL_SECS..=MAX_INTERVAL_SECS`.
pub fn parse_schedule_interval(text: &str) -> Result<i64, IntervalError> {
    match parse_interval(text) {
        None => Err(IntervalError::Invalid),
        Some(secs) if secs < MIN_INTERVAL_SECS => Err(IntervalError::TooShort),
        Some(secs) if secs > MAX_INTERVAL_SECS => Err(IntervalError::TooLong),
        Some(secs) => Ok(secs),
    }
}

/// Admin `/vip` sub-commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VipAction {
    Add { user_id: i64, days: i64 },
    Remove { user_id: i64 },
    List,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VipParseError {
    Usage,
    BadArguments(&'static str),
    InvalidNumber,
    NonPositiveDays,
    TooManyDays,
    UnknownAction(String),
}

pub fn parse_vip(args: &[String]) -> Result<VipAction, VipParseError> {
    let action = args.first().ok_or(VipParseError::Usage)?.to_lowercase();
    let number = |s: &str| -> Result<i64, VipParseError> {
        if s.is_empty() || !s.chars().all(|c| c.is_ascii_digit()) {
            return Err(VipParseError::InvalidNumber);
        }
        s.parse().map_err(|_| VipParseError::InvalidNumber)
    };

    match action.as_str() {
        "add" => {
            if args.len() != 3 {
                return Err(VipParseError::BadArguments("add"));
            }
            let user_id = number(&args[1])?;
            let days = number(&args[2])?;
            if days <= 0 {
                return Err(VipParseError::NonPositiveDays);
            }
            if days > MAX_VIP_DAYS {
                return Err(VipParseError::TooManyDays);
            }
            Ok(VipAction::Add { user_id, days })
        }
        "remove" => {
            if args.len() != 2 {
                return Err(VipParseError::BadArguments("remove"));
            }
            Ok(VipAction::Remove {
                user_id: number(&args[1])?,
            })
        }
        "list" => Ok(VipAction::List),
        _ => Err(VipParseError::UnknownAction(action)),
    }
}
