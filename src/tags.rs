//! Placeholder-tag substitution for free-text report templates.
//!
//! Templates contain zero or more `[tag]` / `[tag:param:...]` placeholders.
//! Simple tags substitute inline; `события` and `успеваемость` splice whole
//! paragraph blocks resolved against the database at render time. Scanning is
//! left-to-right; a `[` with no matching `]` stops the scan and the remainder
//! is left verbatim. Unknown tags stay bracketed and untouched.

use chrono::NaiveDate;
use rusqlite::Connection;

use crate::docx::Paragraph;
use crate::period::{self, TERM_WHOLE_YEAR};

pub fn expand(conn: &Connection, text: &str, today: NaiveDate) -> anyhow::Result<Vec<Paragraph>> {
    let mut paragraphs = Vec::new();
    let mut line = String::new();
    let mut rest = text;

    while let Some(open) = rest.find('[') {
        let (head, bracketed) = rest.split_at(open);
        push_lines(&mut paragraphs, &mut line, head);

        let Some(close) = bracketed.find(']') else {
            // Unterminated tag: the remainder is left as-is, scanning stops.
            push_lines(&mut paragraphs, &mut line, bracketed);
            rest = "";
            break;
        };
        let tag = &bracketed[1..close];
        rest = &bracketed[close + 1..];

        match resolve(conn, tag, today)? {
            Resolved::Inline(value) => line.push_str(&value),
            Resolved::Blocks(blocks) => {
                flush(&mut paragraphs, &mut line);
                paragraphs.extend(blocks);
            }
            Resolved::Unknown => {
                line.push('[');
                line.push_str(tag);
                line.push(']');
            }
        }
    }

    push_lines(&mut paragraphs, &mut line, rest);
    flush(&mut paragraphs, &mut line);
    Ok(paragraphs)
}

pub fn to_html(paragraphs: &[Paragraph]) -> Vec<String> {
    paragraphs.iter().map(|p| p.to_html()).collect()
}

enum Resolved {
    Inline(String),
    Blocks(Vec<Paragraph>),
    Unknown,
}

fn resolve(conn: &Connection, tag: &str, today: NaiveDate) -> anyhow::Result<Resolved> {
    let mut parts = tag.split(':');
    let name = parts.next().unwrap_or("").trim();
    let params: Vec<&str> = parts.map(str::trim).collect();

    let resolved = match name {
        "дата" => Resolved::Inline(period::format_date(today)),
        "учебный год" => Resolved::Inline(period::academic_year(today)),
        "учеников" => {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM students WHERE status_id = 1 AND is_dismissed = 0",
                [],
                |r| r.get(0),
            )?;
            Resolved::Inline(n.to_string())
        }
        "преподавателей" => {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM teachers", [], |r| r.get(0))?;
            Resolved::Inline(n.to_string())
        }
        "события" => Resolved::Blocks(resolve_events(conn, &params, today)?),
        "успеваемость" => Resolved::Blocks(resolve_performance(conn, &params, today)?),
        _ => Resolved::Unknown,
    };
    Ok(resolved)
}

/// Params are positional but forgiving: any numeric param is the term, any
/// recognized keyword is the event type filter.
fn parse_event_params(params: &[&str]) -> (Option<EventKind>, Option<u32>) {
    let mut kind = None;
    let mut term = None;
    for p in params {
        if let Ok(n) = p.parse::<u32>() {
            if (1..=TERM_WHOLE_YEAR).contains(&n) {
                term = Some(n);
            }
        } else {
            match *p {
                "концерты" => kind = Some(EventKind::Concerts),
                "конкурсы" => kind = Some(EventKind::Contests),
                _ => {}
            }
        }
    }
    (kind, term)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum EventKind {
    Concerts,
    Contests,
}

fn resolve_events(
    conn: &Connection,
    params: &[&str],
    today: NaiveDate,
) -> anyhow::Result<Vec<Paragraph>> {
    let (kind, term) = parse_event_params(params);
    let academic_year = period::academic_year(today);
    let mut blocks = Vec::new();

    if kind != Some(EventKind::Contests) {
        blocks.extend(concert_blocks(conn, &academic_year, term)?);
    }
    if kind != Some(EventKind::Concerts) {
        blocks.extend(contest_blocks(conn, &academic_year, term)?);
    }
    Ok(blocks)
}

fn concert_blocks(
    conn: &Connection,
    academic_year: &str,
    term: Option<u32>,
) -> anyhow::Result<Vec<Paragraph>> {
    let mut stmt = conn.prepare(
        "SELECT c.id, c.date, c.place, c.title
         FROM concerts c
         WHERE c.academic_year = ? AND (?2 IS NULL OR ?2 = 5 OR c.term = ?2)
         ORDER BY c.date",
    )?;
    let events = stmt
        .query_map((academic_year, term), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut blocks = Vec::new();
    for (id, date, place, title) in events {
        blocks.push(
            Paragraph::new()
                .bold(format!("Концерт «{}»", title))
                .text(format!(" ({}, {})", display_date(&date), place)),
        );
        let mut stmt = conn.prepare(
            "SELECT s.short_name, lt.short_name, e.name, et.short_name
             FROM concert_participations p
             LEFT JOIN students s ON s.id = p.student_id
             LEFT JOIN teachers lt ON lt.id = s.lead_teacher_id
             LEFT JOIN ensembles e ON e.id = p.ensemble_id
             LEFT JOIN teachers et ON et.id = e.teacher_id
             WHERE p.concert_id = ?",
        )?;
        let participants = stmt
            .query_map([&id], |row| {
                Ok((
                    row.get::<_, Option<String>>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        for (student, lead, ensemble, leader) in participants {
            blocks.push(Paragraph::new().text(participant_line(
                student, lead, ensemble, leader, None,
            )));
        }
    }
    Ok(blocks)
}

fn contest_blocks(
    conn: &Connection,
    academic_year: &str,
    term: Option<u32>,
) -> anyhow::Result<Vec<Paragraph>> {
    let mut stmt = conn.prepare(
        "SELECT c.id, c.date, c.place, c.title
         FROM contests c
         WHERE c.academic_year = ? AND (?2 IS NULL OR ?2 = 5 OR c.term = ?2)
         ORDER BY c.date",
    )?;
    let events = stmt
        .query_map((academic_year, term), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut blocks = Vec::new();
    for (id, date, place, title) in events {
        blocks.push(
            Paragraph::new()
                .bold(format!("Конкурс «{}»", title))
                .text(format!(" ({}, {})", display_date(&date), place)),
        );
        let mut stmt = conn.prepare(
            "SELECT s.short_name, lt.short_name, e.name, et.short_name, p.result
             FROM contest_participations p
             LEFT JOIN students s ON s.id = p.student_id
             LEFT JOIN teachers lt ON lt.id = s.lead_teacher_id
             LEFT JOIN ensembles e ON e.id = p.ensemble_id
             LEFT JOIN teachers et ON et.id = e.teacher_id
             WHERE p.contest_id = ?",
        )?;
        let participants = stmt
            .query_map([&id], |row| {
                Ok((
                    row.get::<_, Option<String>>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        for (student, lead, ensemble, leader, result) in participants {
            blocks.push(Paragraph::new().text(participant_line(
                student,
                lead,
                ensemble,
                leader,
                Some(&result),
            )));
        }
    }
    Ok(blocks)
}

fn participant_line(
    student: Option<String>,
    lead_teacher: Option<String>,
    ensemble: Option<String>,
    leader: Option<String>,
    result: Option<&str>,
) -> String {
    let mut line = match (student, ensemble) {
        (Some(name), _) => format!(
            "\t{} (преп.: {})",
            name,
            lead_teacher.unwrap_or_default()
        ),
        (None, Some(name)) => format!(
            "\tансамбль «{}» (рук.: {})",
            name,
            leader.unwrap_or_default()
        ),
        (None, None) => String::from("\t—"),
    };
    if let Some(result) = result {
        line.push_str(&format!(" — {}", result));
    }
    line
}

fn resolve_performance(
    conn: &Connection,
    params: &[&str],
    today: NaiveDate,
) -> anyhow::Result<Vec<Paragraph>> {
    let mut term = None;
    let mut dept_filter = None;
    for p in params {
        if let Ok(n) = p.parse::<u32>() {
            if (1..=TERM_WHOLE_YEAR).contains(&n) {
                term = Some(n);
            }
        } else if !p.is_empty() {
            dept_filter = Some(p.to_lowercase());
        }
    }
    let term = term.unwrap_or_else(|| period::term(today).unwrap_or(TERM_WHOLE_YEAR));
    let academic_year = period::academic_year(today);

    let summaries = crate::reports::collect_term_summaries(conn, term, &academic_year)?;
    let mut blocks = Vec::new();
    for summary in summaries {
        if let Some(filter) = &dept_filter {
            if !summary.department_title.to_lowercase().contains(filter) {
                continue;
            }
        }
        blocks.extend(crate::reports::summary_paragraphs(&summary));
        // First substring match wins when a department filter is given.
        if dept_filter.is_some() {
            break;
        }
    }
    Ok(blocks)
}

/// ISO stored dates render as dd.mm.yyyy; anything unparsable passes through.
fn display_date(stored: &str) -> String {
    NaiveDate::parse_from_str(stored, "%Y-%m-%d")
        .map(period::format_date)
        .unwrap_or_else(|_| stored.to_string())
}

fn push_lines(paragraphs: &mut Vec<Paragraph>, line: &mut String, text: &str) {
    let mut first = true;
    for part in text.split('\n') {
        if !first {
            flush_always(paragraphs, line);
        }
        first = false;
        line.push_str(part);
    }
}

fn flush(paragraphs: &mut Vec<Paragraph>, line: &mut String) {
    if !line.is_empty() {
        paragraphs.push(Paragraph::new().text(std::mem::take(line)));
    }
}

fn flush_always(paragraphs: &mut Vec<Paragraph>, line: &mut String) {
    paragraphs.push(Paragraph::new().text(std::mem::take(line)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use rusqlite::Connection;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open db");
        conn.execute("PRAGMA foreign_keys = ON", []).expect("pragma");
        db::test_support::init(&conn);
        conn
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 10, 15).expect("date")
    }

    fn plain(paragraphs: &[Paragraph]) -> Vec<String> {
        paragraphs.iter().map(|p| p.plain_text()).collect()
    }

    #[test]
    fn simple_tags_substitute_inline() {
        let conn = test_conn();
        let out = expand(&conn, "Сегодня [дата], [учебный год] учебный год.", today())
            .expect("expand");
        assert_eq!(
            plain(&out),
            vec!["Сегодня 15.10.2024, 2024-2025 учебный год.".to_string()]
        );
    }

    #[test]
    fn counts_reflect_live_rows() {
        let conn = test_conn();
        conn.execute(
            "INSERT INTO departments(id, full_name, short_name, title) VALUES('d', 'Ф', 'ф-но', 'фортепианное')",
            [],
        )
        .expect("dept");
        conn.execute(
            "INSERT INTO teachers(id, full_name, short_name) VALUES('t', 'Иванова Анна Петровна', 'Иванова А. П.')",
            [],
        )
        .expect("teacher");
        for (id, status, dismissed) in [("s1", 1, 0), ("s2", 1, 1), ("s3", 4, 0)] {
            conn.execute(
                "INSERT INTO students(id, full_name, department_id, admission_year, study_years,
                     class_level, status_id, is_dismissed, lead_teacher_id, address,
                     mother_full_name, mother_workplace, mother_occupation, mother_contact_phone,
                     father_full_name, father_workplace, father_occupation, father_contact_phone)
                 VALUES(?, 'Ученик', 'd', 2022, 8, 1, ?, ?, 't', '', '', '', '', '', '', '', '', '')",
                (id, status, dismissed),
            )
            .expect("student");
        }
        let out = expand(&conn, "[учеников] / [преподавателей]", today()).expect("expand");
        assert_eq!(plain(&out), vec!["1 / 1".to_string()]);
    }

    #[test]
    fn unknown_tag_left_bracketed() {
        let conn = test_conn();
        let out = expand(&conn, "Stats: [событие count]", today()).expect("expand");
        assert_eq!(plain(&out), vec!["Stats: [событие count]".to_string()]);
    }

    #[test]
    fn unterminated_bracket_leaves_remainder_verbatim() {
        let conn = test_conn();
        let out = expand(&conn, "До [дата] и после [учеников без конца", today())
            .expect("expand");
        assert_eq!(
            plain(&out),
            vec!["До 15.10.2024 и после [учеников без конца".to_string()]
        );
    }

    #[test]
    fn performance_tag_resolves_department_by_substring() {
        let conn = test_conn();
        conn.execute(
            "INSERT INTO departments(id, full_name, short_name, title)
             VALUES('d1', 'Фортепианное отделение', 'ф-но', 'фортепианное')",
            [],
        )
        .expect("dept");
        conn.execute(
            "INSERT INTO department_report_items(id, department_id, term, academic_year,
                 total, got_best, got_good, got_avg, got_bad, quantity, quality)
             VALUES('r1', 'd1', 1, '2024-2025', 10, 3, 4, 2, 1, 90, 70)",
            [],
        )
        .expect("report");

        let out = expand(&conn, "[успеваемость:1:ФОРТЕ]", today()).expect("expand");
        let text = plain(&out).join("\n");
        assert!(text.contains("фортепианное"), "got: {}", text);
        assert!(text.contains("70"), "quality missing: {}", text);
        assert!(text.contains("90"), "quantity missing: {}", text);

        // No matching department contributes nothing.
        let out = expand(&conn, "[успеваемость:1:скрип]", today()).expect("expand");
        assert!(out.is_empty());
    }

    #[test]
    fn events_tag_lists_participants_with_results() {
        let conn = test_conn();
        conn.execute(
            "INSERT INTO teachers(id, full_name, short_name) VALUES('t', 'Иванова Анна Петровна', 'Иванова А. П.')",
            [],
        )
        .expect("teacher");
        conn.execute(
            "INSERT INTO contests(id, term, academic_year, date, place, title, teacher_id)
             VALUES('c1', 1, '2024-2025', '2024-10-01', 'ДМШ', 'Юные таланты', 't')",
            [],
        )
        .expect("contest");
        conn.execute(
            "INSERT INTO ensembles(id, name, teacher_id) VALUES('e1', 'Каприс', 't')",
            [],
        )
        .expect("ensemble");
        conn.execute(
            "INSERT INTO contest_participations(id, contest_id, ensemble_id, result)
             VALUES('p1', 'c1', 'e1', 'лауреат I степени')",
            [],
        )
        .expect("participation");

        let out = expand(&conn, "[события:конкурсы:1]", today()).expect("expand");
        let text = plain(&out).join("\n");
        assert!(text.contains("Юные таланты"), "got: {}", text);
        assert!(text.contains("Каприс"), "got: {}", text);
        assert!(text.contains("лауреат I степени"), "got: {}", text);
    }
}
