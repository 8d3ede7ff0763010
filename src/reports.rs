//! Report aggregation and generated school documents.
//!
//! Builders return a `docx::Document` ready to pack; handlers decide the
//! output path and the suggested attachment filename.

use chrono::NaiveDate;
use rusqlite::Connection;
use serde::Serialize;

use crate::docx::{Document, Paragraph, Table};
use crate::period;
use crate::stats;
use crate::tags;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportRow {
    pub total: i64,
    pub got_best: i64,
    pub got_good: i64,
    pub got_avg: i64,
    pub got_bad: i64,
    pub quantity: i64,
    pub quality: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamRow {
    pub id: String,
    pub date: String,
    pub discipline: String,
    pub exam_type: String,
    pub protocol_number: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DepartmentSummary {
    pub department_id: String,
    pub department_title: String,
    pub department_short: String,
    pub report: ReportRow,
    pub exams: Vec<ExamRow>,
}

/// One summary block per department that filed a report for the period,
/// ordered by department short name. Departments without a stored report row
/// are skipped.
pub fn collect_term_summaries(
    conn: &Connection,
    term: u32,
    academic_year: &str,
) -> anyhow::Result<Vec<DepartmentSummary>> {
    let mut stmt = conn.prepare(
        "SELECT d.id, d.title, d.short_name,
                r.total, r.got_best, r.got_good, r.got_avg, r.got_bad,
                r.quantity, r.quality
         FROM department_report_items r
         JOIN departments d ON d.id = r.department_id
         WHERE r.term = ? AND r.academic_year = ?
         ORDER BY d.short_name",
    )?;
    let rows = stmt
        .query_map((term, academic_year), |row| {
            Ok(DepartmentSummary {
                department_id: row.get(0)?,
                department_title: row.get(1)?,
                department_short: row.get(2)?,
                report: ReportRow {
                    total: row.get(3)?,
                    got_best: row.get(4)?,
                    got_good: row.get(5)?,
                    got_avg: row.get(6)?,
                    got_bad: row.get(7)?,
                    quantity: row.get::<_, Option<i64>>(8)?.unwrap_or(0),
                    quality: row.get::<_, Option<i64>>(9)?.unwrap_or(0),
                },
                exams: Vec::new(),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut summaries = rows;
    for summary in &mut summaries {
        let mut stmt = conn.prepare(
            "SELECT e.id, e.date, e.discipline, t.name, e.protocol_number
             FROM exams e
             JOIN exam_types t ON t.id = e.exam_type_id
             WHERE e.department_id = ? AND e.term = ? AND e.academic_year = ?
             ORDER BY e.date",
        )?;
        summary.exams = stmt
            .query_map((&summary.department_id, term, academic_year), |row| {
                Ok(ExamRow {
                    id: row.get(0)?,
                    date: row.get(1)?,
                    discipline: row.get(2)?,
                    exam_type: row.get(3)?,
                    protocol_number: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
    }
    Ok(summaries)
}

/// Paragraph rendition of one department summary, shared by the performance
/// tag and the department report document.
pub fn summary_paragraphs(summary: &DepartmentSummary) -> Vec<Paragraph> {
    let mut out = vec![Paragraph::new().bold(format!(
        "{} ({})",
        capitalize(&summary.department_title),
        summary.department_short
    ))];
    out.extend(report_paragraphs(&summary.report));
    for exam in &summary.exams {
        out.push(Paragraph::new().text(format!(
            "Протокол №{} от {} — {} ({})",
            exam.protocol_number,
            display_date(&exam.date),
            exam.discipline,
            exam.exam_type
        )));
    }
    out
}

fn report_paragraphs(report: &ReportRow) -> Vec<Paragraph> {
    let mut roster = Paragraph::new();
    let mut text = format!("Всего на отделении обучающихся: {}, из них:", report.total);
    for (count, label) in [
        (report.got_best, "отлично"),
        (report.got_good, "хорошо"),
        (report.got_avg, "удовлетворительно"),
        (report.got_bad, "неудовлетворительно"),
    ] {
        if count > 0 {
            text.push_str(&format!("\n\t– {}: {}", label, count));
        }
    }
    roster = roster.text(text);
    let indicators = Paragraph::new().text(format!(
        "Количественная успеваемость: {}%\nКачественная успеваемость: {}%",
        report.quantity, report.quality
    ));
    vec![roster, indicators]
}

struct StudentCard {
    full_name: String,
    birth_date: Option<String>,
    admission_year: i64,
    department_short: String,
    address: String,
    mother_full_name: String,
    mother_contact_phone: String,
    father_full_name: String,
    father_contact_phone: String,
    dismission_date: Option<String>,
    dismission_reason: Option<String>,
    cert_no: Option<String>,
}

fn load_student_card(conn: &Connection, student_id: &str) -> anyhow::Result<StudentCard> {
    let card = conn.query_row(
        "SELECT s.full_name, s.birth_date, s.admission_year, d.short_name, s.address,
                s.mother_full_name, s.mother_contact_phone,
                s.father_full_name, s.father_contact_phone,
                s.dismission_date, s.dismission_reason, s.cert_no
         FROM students s
         JOIN departments d ON d.id = s.department_id
         WHERE s.id = ?",
        [student_id],
        |row| {
            Ok(StudentCard {
                full_name: row.get(0)?,
                birth_date: row.get(1)?,
                admission_year: row.get(2)?,
                department_short: row.get(3)?,
                address: row.get(4)?,
                mother_full_name: row.get(5)?,
                mother_contact_phone: row.get(6)?,
                father_full_name: row.get(7)?,
                father_contact_phone: row.get(8)?,
                dismission_date: row.get(9)?,
                dismission_reason: row.get(10)?,
                cert_no: row.get(11)?,
            })
        },
    )?;
    Ok(card)
}

fn title_page_blocks(doc: &mut Document, card: &StudentCard) {
    doc.push(Paragraph::centered().sized_bold("ЛИЧНОЕ ДЕЛО ОБУЧАЮЩЕГОСЯ\n", 24));
    doc.push(
        Paragraph::new()
            .bold("Фамилия, имя, отчество: ")
            .text(&card.full_name),
    );
    doc.push(
        Paragraph::new().bold("Дата рождения: ").text(
            card.birth_date
                .as_deref()
                .map(display_date)
                .unwrap_or_default(),
        ),
    );
    doc.push(
        Paragraph::centered().italic("\nСведения о родителях/законных представителях"),
    );
    doc.push(Paragraph::new().bold("Мать: ").text(&card.mother_full_name));
    doc.push(
        Paragraph::new()
            .bold("Контактный телефон: ")
            .text(format!("{}\n", card.mother_contact_phone)),
    );
    doc.push(Paragraph::new().bold("Отец: ").text(&card.father_full_name));
    doc.push(
        Paragraph::new()
            .bold("Контактный телефон: ")
            .text(format!("{}\n", card.father_contact_phone)),
    );
    doc.push(
        Paragraph::new()
            .bold("Адрес проживания: ")
            .text(format!("{}\n", card.address)),
    );
    doc.push(
        Paragraph::new()
            .bold("Дата поступления: ")
            .text(format!("01.09.{}", card.admission_year)),
    );
    doc.push(
        Paragraph::new()
            .bold("Наименование образовательной программы: ")
            .text(&card.department_short),
    );
    let dismissal = match (&card.dismission_date, &card.dismission_reason) {
        (Some(date), reason) => format!(
            "{}, {}",
            display_date(date),
            reason.as_deref().unwrap_or_default()
        ),
        (None, _) => String::from(" \n"),
    };
    doc.push(
        Paragraph::new()
            .bold("Дата и причина отчисления из ДМШ: ")
            .text(dismissal),
    );
    doc.push(
        Paragraph::new()
            .bold("№ свидетельства об окончании ДМШ: ")
            .text(card.cert_no.clone().unwrap_or_default()),
    );
}

pub fn student_title_page(conn: &Connection, student_id: &str) -> anyhow::Result<Document> {
    let card = load_student_card(conn, student_id)?;
    let mut doc = Document::new("PT Serif", 16, (2.4, 1.0, 1.0, 1.0));
    title_page_blocks(&mut doc, &card);
    Ok(doc)
}

/// Personal-file pages for every active student, one page each.
pub fn all_title_pages(conn: &Connection) -> anyhow::Result<Document> {
    let mut stmt = conn.prepare(
        "SELECT id FROM students WHERE status_id = 1 ORDER BY full_name",
    )?;
    let ids = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut doc = Document::new("PT Serif", 16, (2.4, 1.0, 1.0, 1.0));
    for id in ids {
        let card = load_student_card(conn, &id)?;
        title_page_blocks(&mut doc, &card);
        doc.page_break();
    }
    Ok(doc)
}

pub fn exam_protocol(conn: &Connection, exam_id: &str) -> anyhow::Result<Document> {
    let (date, exam_type, academic_year, protocol_number, commission): (
        String,
        String,
        String,
        i64,
        Option<String>,
    ) = conn.query_row(
        "SELECT e.date, t.name, e.academic_year, e.protocol_number, e.commission_members
         FROM exams e
         JOIN exam_types t ON t.id = e.exam_type_id
         WHERE e.id = ?",
        [exam_id],
        |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
            ))
        },
    )?;

    let mut stmt = conn.prepare(
        "SELECT s.short_name, s.class_level, s.study_years, s.is_deep_level,
                t.short_name, i.program, i.grade
         FROM exam_items i
         JOIN students s ON s.id = i.student_id
         JOIN teachers t ON t.id = i.teacher_id
         WHERE i.exam_id = ?",
    )?;
    let items = stmt
        .query_map([exam_id], |row| {
            Ok((
                row.get::<_, Option<String>>(0)?.unwrap_or_default(),
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut doc = Document::new("PT Astra Serif", 14, (1.0, 1.0, 1.0, 1.0));
    doc.push(
        Paragraph::centered()
            .bold(format!(
                "Протокол №{} от {}",
                protocol_number,
                display_date(&date)
            ))
            .text(format!("\n{}", exam_type))
            .italic(format!("\n{} учебный год", academic_year)),
    );

    let mut attendees = Paragraph::right_aligned().italic("Присутствовали:\n");
    for member in commission.as_deref().unwrap_or_default().split(", ") {
        if !member.is_empty() {
            attendees = attendees.text(format!("{}\n", member));
        }
    }
    doc.push(attendees);

    for (short_name, class_level, study_years, is_deep_level, teacher, program, grade) in &items {
        let deep = if *is_deep_level != 0 { "углубл. ур., " } else { "" };
        let mut p = Paragraph::new()
            .bold(format!("{}, {}/{}", short_name, class_level, study_years))
            .text(format!(" ({}кл. преп.: {})", deep, teacher));
        for piece in program.split(['\r', '\n']).filter(|s| !s.is_empty()) {
            p = p.text(format!("\n\t{}", piece));
        }
        p = p.text("\n\t\tОценка: ").bold(grade.clone());
        doc.push(p);
    }

    let grade_stats = stats::tally_grades(items.iter().map(|i| i.6.as_str()));
    let mut totals = Paragraph::new().text(format!(
        "Всего сдавало {} обуч., из них:",
        grade_stats.total
    ));
    let labels = [
        "не сдавало (по уважительной причине)",
        "\"неудовлетворительно\"",
        "\"удовлетворительно\"",
        "\"хорошо\"",
        "\"отлично\"",
    ];
    // Best first, "не сдавал" last.
    for idx in (0..5).rev() {
        if grade_stats.counts[idx] > 0 {
            totals = totals
                .text(format!("\n\t{}: ", labels[idx]))
                .bold(grade_stats.counts[idx].to_string());
        }
    }
    doc.push(totals);
    doc.push(Paragraph::new().text(format!(
        "Количественная успеваемость: {}%\nКачественная успеваемость: {}%",
        grade_stats.quantity, grade_stats.quality
    )));
    Ok(doc)
}

/// Roster list for one department, or for all of them grouped by department.
pub fn department_students(
    conn: &Connection,
    department_id: Option<&str>,
    today: NaiveDate,
) -> anyhow::Result<Document> {
    let mut doc = Document::new("PT Serif", 14, (1.5, 1.5, 1.5, 1.5));
    doc.push(Paragraph::centered().bold(format!(
        "Список всех учеников по состоянию на {}",
        period::format_date(today)
    )));

    let departments: Vec<(String, String, String)> = match department_id {
        Some(id) => vec![conn.query_row(
            "SELECT id, title, short_name FROM departments WHERE id = ?",
            [id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?],
        None => {
            let mut stmt = conn.prepare(
                "SELECT id, title, short_name FROM departments ORDER BY short_name",
            )?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        }
    };

    let mut body = Paragraph::new();
    for (dep_id, title, short_name) in departments {
        body = body.bold(format!("{} ({}):\n", capitalize(&title), short_name));
        let mut stmt = conn.prepare(
            "SELECT full_name, class_level, study_years, is_deep_level
             FROM students
             WHERE department_id = ? AND status_id = 1
             ORDER BY class_level, full_name",
        )?;
        let students = stmt
            .query_map([&dep_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        for (i, (full_name, class_level, study_years, is_deep_level)) in
            students.iter().enumerate()
        {
            let deep = if *is_deep_level != 0 { ", углубл. уровень" } else { "" };
            body = body.text(format!(
                "{}. {} ({}/{}{})\n",
                i + 1,
                full_name,
                class_level,
                study_years,
                deep
            ));
        }
        body = body.text("\n");
    }
    doc.push(body);
    Ok(doc)
}

pub fn department_report(
    conn: &Connection,
    department_id: &str,
    term: u32,
    academic_year: &str,
) -> anyhow::Result<Document> {
    let (title, short_name): (String, String) = conn.query_row(
        "SELECT title, short_name FROM departments WHERE id = ?",
        [department_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    let report = conn.query_row(
        "SELECT total, got_best, got_good, got_avg, got_bad, quantity, quality
         FROM department_report_items
         WHERE department_id = ? AND term = ? AND academic_year = ?",
        (department_id, term, academic_year),
        |row| {
            Ok(ReportRow {
                total: row.get(0)?,
                got_best: row.get(1)?,
                got_good: row.get(2)?,
                got_avg: row.get(3)?,
                got_bad: row.get(4)?,
                quantity: row.get::<_, Option<i64>>(5)?.unwrap_or(0),
                quality: row.get::<_, Option<i64>>(6)?.unwrap_or(0),
            })
        },
    )?;

    let mut doc = Document::new("PT Serif", 14, (1.0, 1.0, 1.0, 1.0));
    doc.push(Paragraph::centered().bold(
        format!("ОТЧЁТ ОБ УСПЕВАЕМОСТИ ОТДЕЛЕНИЯ {} ({})\n", title, short_name).to_uppercase(),
    ));
    doc.extend(report_paragraphs(&report));
    Ok(doc)
}

/// Concert plan table for one academic year, ordered by date.
pub fn events_plan(conn: &Connection, academic_year: &str) -> anyhow::Result<Document> {
    let mut stmt = conn.prepare(
        "SELECT date, title FROM concerts WHERE academic_year = ? ORDER BY date",
    )?;
    let concerts = stmt
        .query_map([academic_year], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut doc = Document::new("PT Serif", 14, (1.5, 1.5, 1.5, 1.5));
    doc.push(Paragraph::centered().text(format!(
        "План тематических мероприятий в {} учебном году",
        academic_year
    )));

    let mut rows = vec![vec!["Дата".to_string(), "Название".to_string()]];
    for (date, title) in concerts {
        rows.push(vec![display_date(&date), title]);
    }
    doc.push_table(Table {
        rows,
        col_widths_cm: vec![5.0, 13.0],
    });
    Ok(doc)
}

/// Tag template rendered straight into a document.
pub fn template_document(
    conn: &Connection,
    text: &str,
    today: NaiveDate,
) -> anyhow::Result<Document> {
    let paragraphs = tags::expand(conn, text, today)?;
    let mut doc = Document::new("PT Serif", 14, (1.5, 1.5, 1.5, 1.5));
    doc.extend(paragraphs);
    Ok(doc)
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

fn display_date(stored: &str) -> String {
    NaiveDate::parse_from_str(stored, "%Y-%m-%d")
        .map(period::format_date)
        .unwrap_or_else(|_| stored.to_string())
}
