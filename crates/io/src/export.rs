use anyhow::{Context, Result};
use model::*;
use serde::Serialize;
use std::{fs::File, io::{BufRead, BufReader, BufWriter, Write}, path::Path};

pub fn export_csv(records: &[SessionRecord], path: &Path) -> Result<()> {
    let mut w = csv::Writer::from_path(path)
        .with_context(|| format!("create {}", path.display()))?;
    for r in records {
        w.serialize(CsvRow::from(r))?;
    }
    w.flush()?;
    Ok(())
}

pub fn export_ndjson(records: &[SessionRecord], path: &Path) -> Result<()> {
    let f = File::create(path).with_context(|| format!("create {}", path.display()))?;
    let mut w = BufWriter::new(f);
    for r in records {
        writeln!(w, "{}", serde_json::to_string(r)?)?;
    }
    w.flush()?;
    Ok(())
}

pub fn import_ndjson(path: &Path) -> Result<Vec<SessionRecord>> {
    let f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut records = vec![];
    for (n, line) in BufReader::new(f).lines().enumerate() {
        let s = line?;
        if s.trim().is_empty() { continue; }
        let r: SessionRecord = serde_json::from_str(&s)
            .with_context(|| format!("line {}", n + 1))?;
        records.push(r);
    }
    Ok(records)
}

#[derive(Serialize)]
struct CsvRow<'a> {
    id: String,
    date: &'a str,
    duration: &'a str,
    distance_km: f64,
    calories: f64,
    speed: f64,
    max_speed: f64,
    heart_rate: f64,
    gauge: &'static str,
    avg_resistance: f64,
    max_incline: f64,
    goal: String,
}

impl<'a> From<&'a SessionRecord> for CsvRow<'a> {
    fn from(r: &'a SessionRecord) -> Self {
        Self {
            id: r.id.simple().to_string(),
            date: &r.date,
            duration: &r.duration_formatted,
            distance_km: r.distance_km,
            calories: r.calories,
            speed: r.speed,
            max_speed: r.max_speed,
            heart_rate: r.heart_rate,
            gauge: match r.gauge { GaugeKind::Resistance => "resistance", GaugeKind::Incline => "incline" },
            avg_resistance: r.avg_resistance,
            max_incline: r.max_incline,
            goal: r.goal.map(|g| format!("{:?}:{}", g.kind, g.target).to_lowercase()).unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::create_test_record;

    #[test]
    fn test_ndjson_export_import() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.ndjson");
        let records = vec![create_test_record(30), create_test_record(45)];
        export_ndjson(&records, &path).unwrap();
        let back = import_ndjson(&path).unwrap();
        assert_eq!(back, records);
    }

    #[test]
    fn test_csv_export_has_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.csv");
        let mut r = create_test_record(754);
        r.goal = Some(Goal { kind: GoalKind::Distance, target: 1.0 });
        export_csv(&[r], &path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        let header = lines.next().unwrap();
        assert!(header.starts_with("id,date,duration,distance_km,calories,speed,max_speed"));
        assert!(!header.contains("avg_speed"));
        let row = lines.next().unwrap();
        assert!(row.contains("00:12:34"));
        assert!(row.ends_with("distance:1"));
    }
}
