/// Grade tallies for one graded session or report row.
///
/// Grades are free text ("5", "4+", "3-"); a grade counts toward every digit
/// 1..=5 it contains, which matches how commissions write combined marks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GradeStats {
    pub total: usize,
    /// counts[0] is grade 1 ("не сдавал"), counts[4] is grade 5.
    pub counts: [usize; 5],
    pub quality: i64,
    pub quantity: i64,
}

pub fn tally_grades<'a, I>(grades: I) -> GradeStats
where
    I: IntoIterator<Item = &'a str>,
{
    let mut total = 0usize;
    let mut counts = [0usize; 5];
    for grade in grades {
        total += 1;
        for (i, digit) in ['1', '2', '3', '4', '5'].iter().enumerate() {
            if grade.contains(*digit) {
                counts[i] += 1;
            }
        }
    }
    let (quality, quantity) = percentages(total, counts[4], counts[3], counts[2]);
    GradeStats {
        total,
        counts,
        quality,
        quantity,
    }
}

/// Quality is the share of "good or better" marks, quantity the share of
/// passing marks. Stored once at creation time, never recomputed.
pub fn percentages(total: usize, best: usize, good: usize, avg: usize) -> (i64, i64) {
    if total == 0 {
        return (0, 0);
    }
    let quality = ((best + good) as f64 / total as f64 * 100.0).round() as i64;
    let quantity = ((best + good + avg) as f64 / total as f64 * 100.0).round() as i64;
    (quality, quantity)
}
