use chrono::NaiveDate;
use rusqlite::ffi;

use crate::ipc::error::err;
use crate::ipc::types::Request;

pub fn str_param(req: &Request, name: &str) -> Option<String> {
    req.params
        .get(name)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn i64_param(req: &Request, name: &str) -> Option<i64> {
    req.params.get(name).and_then(|v| v.as_i64())
}

pub fn date_param(req: &Request, name: &str) -> Option<NaiveDate> {
    str_param(req, name).and_then(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d").ok())
}

/// `asOf` defaults to the wall clock; tests pass it explicitly.
pub fn as_of(req: &Request) -> NaiveDate {
    date_param(req, "asOf").unwrap_or_else(|| chrono::Local::now().date_naive())
}

/// Maps SQLite constraint failures to the wire taxonomy: unique/PK clashes
/// become `already_exists`, foreign-key violations `in_use`, check failures
/// `bad_params`. Everything else keeps the generic code.
pub fn db_err(
    id: &str,
    fallback_code: &str,
    e: rusqlite::Error,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    if let rusqlite::Error::SqliteFailure(failure, ref message) = e {
        let message = message.clone().unwrap_or_else(|| e.to_string());
        match failure.extended_code {
            ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY => {
                return err(id, "already_exists", message, details);
            }
            ffi::SQLITE_CONSTRAINT_FOREIGNKEY | ffi::SQLITE_CONSTRAINT_TRIGGER => {
                return err(id, "in_use", message, details);
            }
            ffi::SQLITE_CONSTRAINT_CHECK | ffi::SQLITE_CONSTRAINT_NOTNULL => {
                return err(id, "bad_params", message, details);
            }
            _ => {}
        }
    }
    err(id, fallback_code, e.to_string(), details)
}

/// Surname plus initials: "Иванова Анна Петровна" -> "Иванова А. П.".
pub fn short_name(full_name: &str) -> String {
    let mut parts = full_name.split_whitespace();
    let Some(surname) = parts.next() else {
        return String::new();
    };
    let initials: Vec<String> = parts
        .filter_map(|p| p.chars().next())
        .map(|c| format!("{}.", c))
        .collect();
    if initials.is_empty() {
        surname.to_string()
    } else {
        format!("{} {}", surname, initials.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_name_takes_surname_and_initials() {
        assert_eq!(
            short_name("Иванова Анна Петровна"),
            "Иванова А. П."
        );
        assert_eq!(short_name("Петров Иван"), "Петров И.");
        assert_eq!(short_name("Бах"), "Бах");
        assert_eq!(short_name(""), "");
    }
}
