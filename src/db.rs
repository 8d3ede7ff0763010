use chrono::Utc;
use rusqlite::Connection;
use std::path::{Path, PathBuf};

/// Schema version stamped into fresh databases. Older workspaces are brought
/// up to date by `apply_migrations`.
pub const SCHEMA_VERSION: i64 = 3;

pub fn db_path(workspace: &Path) -> PathBuf {
    workspace.join("music_school.sqlite3")
}

pub fn documents_dir(workspace: &Path) -> PathBuf {
    workspace.join("documents")
}

/// Uploaded method-council protocol files live in a fixed subdirectory.
pub fn protocols_dir(workspace: &Path) -> PathBuf {
    documents_dir(workspace).join("protocols")
}

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    std::fs::create_dir_all(protocols_dir(workspace))?;

    let conn = Connection::open(db_path(workspace))?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    create_schema(&conn)?;
    apply_migrations(&conn)?;
    seed_statuses(&conn)?;
    seed_regions(&conn)?;

    Ok(conn)
}

fn create_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS db_version(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            version INTEGER NOT NULL,
            applied_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS departments(
            id TEXT PRIMARY KEY,
            full_name TEXT NOT NULL,
            short_name TEXT NOT NULL,
            title TEXT NOT NULL,
            UNIQUE(title, full_name, short_name)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL UNIQUE
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teachers(
            id TEXT PRIMARY KEY,
            full_name TEXT NOT NULL,
            short_name TEXT,
            main_department_id TEXT,
            is_combining INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(main_department_id) REFERENCES departments(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_teachers_department ON teachers(main_department_id)",
        [],
    )?;

    // Closed status set, integer-coded: 1 учится, 2 выпущен(а),
    // 3 в академическом отпуске, 4 отчислен(а).
    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_statuses(
            id INTEGER PRIMARY KEY,
            status TEXT NOT NULL UNIQUE
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            full_name TEXT NOT NULL,
            short_name TEXT,
            birth_date TEXT,
            department_id TEXT NOT NULL,
            admission_year INTEGER NOT NULL,
            study_years INTEGER NOT NULL,
            class_level INTEGER NOT NULL DEFAULT 1,
            status_id INTEGER NOT NULL DEFAULT 1,
            contact_phone TEXT,
            lead_teacher_id TEXT NOT NULL,
            address TEXT NOT NULL,
            mother_full_name TEXT NOT NULL,
            mother_workplace TEXT NOT NULL,
            mother_occupation TEXT NOT NULL,
            mother_contact_phone TEXT NOT NULL,
            father_full_name TEXT NOT NULL,
            father_workplace TEXT NOT NULL,
            father_occupation TEXT NOT NULL,
            father_contact_phone TEXT NOT NULL,
            is_deep_level INTEGER NOT NULL DEFAULT 0,
            is_dismissed INTEGER NOT NULL DEFAULT 0,
            dismission_date TEXT,
            dismission_reason TEXT,
            cert_no TEXT,
            FOREIGN KEY(department_id) REFERENCES departments(id),
            FOREIGN KEY(status_id) REFERENCES student_statuses(id),
            FOREIGN KEY(lead_teacher_id) REFERENCES teachers(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_department ON students(department_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_status ON students(status_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_lead_teacher ON students(lead_teacher_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS class_history(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            academic_year INTEGER NOT NULL,
            class_level INTEGER NOT NULL,
            next_class INTEGER,
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_class_history_student ON class_history(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS exam_types(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS exams(
            id TEXT PRIMARY KEY,
            date TEXT NOT NULL,
            term INTEGER,
            exam_type_id TEXT NOT NULL,
            discipline TEXT NOT NULL,
            department_id TEXT NOT NULL,
            commission_members TEXT,
            academic_year TEXT NOT NULL,
            protocol_number INTEGER NOT NULL,
            FOREIGN KEY(exam_type_id) REFERENCES exam_types(id),
            FOREIGN KEY(department_id) REFERENCES departments(id),
            UNIQUE(academic_year, protocol_number)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_exams_department ON exams(department_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_exams_period ON exams(academic_year, term)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS exam_items(
            id TEXT PRIMARY KEY,
            exam_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            teacher_id TEXT NOT NULL,
            program TEXT NOT NULL,
            grade TEXT NOT NULL,
            FOREIGN KEY(exam_id) REFERENCES exams(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(teacher_id) REFERENCES teachers(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_exam_items_exam ON exam_items(exam_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_exam_items_student ON exam_items(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS report_items(
            id TEXT PRIMARY KEY,
            subject_id TEXT NOT NULL,
            teacher_id TEXT NOT NULL,
            term INTEGER NOT NULL,
            academic_year TEXT NOT NULL,
            total INTEGER NOT NULL,
            got_best INTEGER NOT NULL DEFAULT 0,
            got_good INTEGER NOT NULL DEFAULT 0,
            got_avg INTEGER NOT NULL DEFAULT 0,
            got_bad INTEGER NOT NULL DEFAULT 0,
            quantity INTEGER,
            quality INTEGER,
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(teacher_id) REFERENCES teachers(id),
            UNIQUE(subject_id, teacher_id, academic_year, term)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS class_report_items(
            id TEXT PRIMARY KEY,
            teacher_id TEXT NOT NULL,
            department_id TEXT NOT NULL,
            term INTEGER NOT NULL,
            academic_year TEXT NOT NULL,
            total INTEGER NOT NULL,
            got_best INTEGER NOT NULL DEFAULT 0,
            got_good INTEGER NOT NULL DEFAULT 0,
            got_avg INTEGER NOT NULL DEFAULT 0,
            got_bad INTEGER NOT NULL DEFAULT 0,
            quantity INTEGER,
            quality INTEGER,
            FOREIGN KEY(teacher_id) REFERENCES teachers(id),
            FOREIGN KEY(department_id) REFERENCES departments(id),
            UNIQUE(teacher_id, academic_year, term)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS department_report_items(
            id TEXT PRIMARY KEY,
            department_id TEXT NOT NULL,
            term INTEGER NOT NULL,
            academic_year TEXT NOT NULL,
            total INTEGER NOT NULL,
            got_best INTEGER NOT NULL DEFAULT 0,
            got_good INTEGER NOT NULL DEFAULT 0,
            got_avg INTEGER NOT NULL DEFAULT 0,
            got_bad INTEGER NOT NULL DEFAULT 0,
            quantity INTEGER,
            quality INTEGER,
            FOREIGN KEY(department_id) REFERENCES departments(id),
            UNIQUE(department_id, academic_year, term)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS lecture_items(
            id TEXT PRIMARY KEY,
            term INTEGER NOT NULL,
            academic_year TEXT NOT NULL,
            date TEXT NOT NULL,
            title TEXT NOT NULL,
            teacher_id TEXT NOT NULL,
            resp_teacher_id TEXT NOT NULL,
            FOREIGN KEY(teacher_id) REFERENCES teachers(id),
            FOREIGN KEY(resp_teacher_id) REFERENCES teachers(id),
            UNIQUE(teacher_id, title, academic_year, term)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS open_lesson_items(
            id TEXT PRIMARY KEY,
            term INTEGER NOT NULL,
            academic_year TEXT NOT NULL,
            date TEXT NOT NULL,
            title TEXT NOT NULL,
            teacher_id TEXT NOT NULL,
            resp_teacher_id TEXT NOT NULL,
            student_id TEXT,
            FOREIGN KEY(teacher_id) REFERENCES teachers(id),
            FOREIGN KEY(resp_teacher_id) REFERENCES teachers(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(teacher_id, title, academic_year, term, student_id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teacher_courses(
            id TEXT PRIMARY KEY,
            teacher_id TEXT NOT NULL,
            course_type INTEGER NOT NULL,
            title TEXT NOT NULL,
            hours INTEGER NOT NULL,
            start_date TEXT NOT NULL,
            end_date TEXT NOT NULL,
            place TEXT,
            cert_no TEXT NOT NULL,
            FOREIGN KEY(teacher_id) REFERENCES teachers(id),
            UNIQUE(course_type, teacher_id, title)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS method_assemblies(
            id TEXT PRIMARY KEY,
            term INTEGER NOT NULL,
            academic_year TEXT NOT NULL,
            date TEXT NOT NULL,
            title TEXT NOT NULL,
            description TEXT NOT NULL,
            teacher_id TEXT NOT NULL,
            FOREIGN KEY(teacher_id) REFERENCES teachers(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS method_assembly_protocols(
            id TEXT PRIMARY KEY,
            term INTEGER NOT NULL,
            academic_year TEXT NOT NULL,
            date TEXT NOT NULL,
            attendees TEXT NOT NULL,
            number INTEGER NOT NULL,
            secretary_id TEXT NOT NULL,
            agenda TEXT NOT NULL,
            decisions TEXT NOT NULL,
            protocol_file TEXT,
            FOREIGN KEY(secretary_id) REFERENCES teachers(id),
            UNIQUE(academic_year, number)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS ensembles(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            teacher_id TEXT NOT NULL,
            FOREIGN KEY(teacher_id) REFERENCES teachers(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS ensemble_members(
            ensemble_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            PRIMARY KEY(ensemble_id, student_id),
            FOREIGN KEY(ensemble_id) REFERENCES ensembles(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS concerts(
            id TEXT PRIMARY KEY,
            term INTEGER NOT NULL,
            academic_year TEXT NOT NULL,
            date TEXT NOT NULL,
            place TEXT NOT NULL DEFAULT 'ДМШ',
            title TEXT NOT NULL,
            teacher_id TEXT NOT NULL,
            has_passed INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(teacher_id) REFERENCES teachers(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_concerts_period ON concerts(academic_year, term)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS contests(
            id TEXT PRIMARY KEY,
            term INTEGER NOT NULL,
            academic_year TEXT NOT NULL,
            date TEXT NOT NULL,
            place TEXT NOT NULL DEFAULT 'ДМШ',
            title TEXT NOT NULL,
            teacher_id TEXT NOT NULL,
            FOREIGN KEY(teacher_id) REFERENCES teachers(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_contests_period ON contests(academic_year, term)",
        [],
    )?;

    // Exactly one of (student_id, ensemble_id) per participation row.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS concert_participations(
            id TEXT PRIMARY KEY,
            concert_id TEXT NOT NULL,
            student_id TEXT,
            ensemble_id TEXT,
            FOREIGN KEY(concert_id) REFERENCES concerts(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(ensemble_id) REFERENCES ensembles(id),
            UNIQUE(student_id, concert_id),
            CHECK((student_id IS NOT NULL AND ensemble_id IS NULL)
               OR (student_id IS NULL AND ensemble_id IS NOT NULL))
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_concert_participations_concert
         ON concert_participations(concert_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS contest_participations(
            id TEXT PRIMARY KEY,
            contest_id TEXT NOT NULL,
            student_id TEXT,
            ensemble_id TEXT,
            result TEXT NOT NULL,
            FOREIGN KEY(contest_id) REFERENCES contests(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(ensemble_id) REFERENCES ensembles(id),
            CHECK((student_id IS NOT NULL AND ensemble_id IS NULL)
               OR (student_id IS NULL AND ensemble_id IS NOT NULL))
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_contest_participations_contest
         ON contest_participations(contest_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS regions(
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS school_info(
            id TEXT PRIMARY KEY,
            full_title TEXT NOT NULL,
            short_title TEXT NOT NULL,
            region_id INTEGER NOT NULL,
            methodist_id TEXT,
            FOREIGN KEY(region_id) REFERENCES regions(id),
            FOREIGN KEY(methodist_id) REFERENCES teachers(id)
        )",
        [],
    )?;

    Ok(())
}

struct Migration {
    version: i64,
    statements: &'static [&'static str],
}

// Replayed only on databases stamped below SCHEMA_VERSION; fresh databases
// are created with the full schema and stamped at the latest version.
const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 2,
        statements: &["ALTER TABLE students ADD COLUMN contact_phone TEXT"],
    },
    Migration {
        version: 3,
        statements: &["ALTER TABLE method_assembly_protocols ADD COLUMN protocol_file TEXT"],
    },
];

pub fn current_version(conn: &Connection) -> anyhow::Result<i64> {
    let version: Option<i64> =
        conn.query_row("SELECT MAX(version) FROM db_version", [], |r| r.get(0))?;
    Ok(version.unwrap_or(0))
}

/// Brings an existing database up to `SCHEMA_VERSION`. All pending versions
/// run inside one transaction; any failure rolls the whole batch back.
pub fn apply_migrations(conn: &Connection) -> anyhow::Result<()> {
    let current = current_version(conn)?;
    if current == 0 {
        // Fresh database (or one that predates version bookkeeping): the full
        // schema was just ensured, so stamp it current.
        conn.execute(
            "INSERT INTO db_version(version, applied_at) VALUES(?, ?)",
            (SCHEMA_VERSION, Utc::now().to_rfc3339()),
        )?;
        return Ok(());
    }
    if current >= SCHEMA_VERSION {
        return Ok(());
    }

    let tx = conn.unchecked_transaction()?;
    for migration in MIGRATIONS {
        if migration.version <= current {
            continue;
        }
        for sql in migration.statements {
            tx.execute(sql, [])?;
        }
        tx.execute(
            "INSERT INTO db_version(version, applied_at) VALUES(?, ?)",
            (migration.version, Utc::now().to_rfc3339()),
        )?;
    }
    tx.commit()?;
    Ok(())
}

const STATUSES: &[(i64, &str)] = &[
    (1, "учится"),
    (2, "выпущен(а)"),
    (3, "в академическом отпуске"),
    (4, "отчислен(а)"),
];

pub const STATUS_ACTIVE: i64 = 1;
pub const STATUS_GRADUATED: i64 = 2;
pub const STATUS_ON_LEAVE: i64 = 3;
pub const STATUS_DISMISSED: i64 = 4;

fn seed_statuses(conn: &Connection) -> anyhow::Result<()> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM student_statuses", [], |r| r.get(0))?;
    if count > 0 {
        return Ok(());
    }
    for (id, status) in STATUSES {
        conn.execute(
            "INSERT INTO student_statuses(id, status) VALUES(?, ?)",
            (id, status),
        )?;
    }
    Ok(())
}

/// The regions table is a fixed reference list; if the stored count drifts
/// from the expected size it is cleared and reseeded verbatim.
fn seed_regions(conn: &Connection) -> anyhow::Result<()> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM regions", [], |r| r.get(0))?;
    if count == REGIONS.len() as i64 {
        return Ok(());
    }
    let tx = conn.unchecked_transaction()?;
    tx.execute("DELETE FROM regions", [])?;
    for (i, name) in REGIONS.iter().enumerate() {
        tx.execute(
            "INSERT INTO regions(id, name) VALUES(?, ?)",
            ((i + 1) as i64, name),
        )?;
    }
    tx.commit()?;
    Ok(())
}

pub const REGIONS: &[&str] = &[
    "Республика Адыгея",
    "Республика Алтай",
    "Республика Башкортостан",
    "Республика Бурятия",
    "Республика Дагестан",
    "Донецкая Народная Республика",
    "Республика Ингушетия",
    "Кабардино-Балкарская Республика",
    "Республика Калмыкия",
    "Карачаево-Черкесская Республика",
    "Республика Карелия",
    "Республика Коми",
    "Республика Крым",
    "Луганская Народная Республика",
    "Республика Марий Эл",
    "Республика Мордовия",
    "Республика Саха (Якутия)",
    "Республика Северная Осетия — Алания",
    "Республика Татарстан",
    "Республика Тыва",
    "Удмуртская Республика",
    "Республика Хакасия",
    "Чеченская Республика",
    "Чувашская Республика",
    "Алтайский край",
    "Забайкальский край",
    "Камчатский край",
    "Краснодарский край",
    "Красноярский край",
    "Пермский край",
    "Приморский край",
    "Ставропольский край",
    "Хабаровский край",
    "Амурская область",
    "Архангельская область",
    "Астраханская область",
    "Белгородская область",
    "Брянская область",
    "Владимирская область",
    "Волгоградская область",
    "Вологодская область",
    "Воронежская область",
    "Запорожская область",
    "Ивановская область",
    "Иркутская область",
    "Калининградская область",
    "Калужская область",
    "Кемеровская область",
    "Кировская область",
    "Костромская область",
    "Курганская область",
    "Курская область",
    "Ленинградская область",
    "Липецкая область",
    "Магаданская область",
    "Московская область",
    "Мурманская область",
    "Нижегородская область",
    "Новгородская область",
    "Новосибирская область",
    "Омская область",
    "Оренбургская область",
    "Орловская область",
    "Пензенская область",
    "Псковская область",
    "Ростовская область",
    "Рязанская область",
    "Самарская область",
    "Саратовская область",
    "Сахалинская область",
    "Свердловская область",
    "Смоленская область",
    "Тамбовская область",
    "Тверская область",
    "Томская область",
    "Тульская область",
    "Тюменская область",
    "Ульяновская область",
    "Херсонская область",
    "Челябинская область",
    "Ярославская область",
    "Москва",
    "Санкт-Петербург",
    "Севастополь",
    "Еврейская автономная область",
    "Ненецкий автономный округ",
    "Ханты-Мансийский автономный округ — Югра",
    "Чукотский автономный округ",
    "Ямало-Ненецкий автономный округ",
    "Байконур",
    "Федеральная территория «Сириус»",
];

#[cfg(test)]
pub mod test_support {
    use super::*;

    /// Full schema + seeds on an already-open connection, for unit tests that
    /// do not go through `open_db`.
    pub fn init(conn: &Connection) {
        create_schema(conn).expect("schema");
        apply_migrations(conn).expect("migrations");
        seed_statuses(conn).expect("statuses");
        seed_regions(conn).expect("regions");
    }
}
