//! CSV export for replay tick records.

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use crate::sim::types::TickRecord;

/// Column header for CSV telemetry export.
const HEADER: &str = "step,time_min,power_kw,load_control_kw,average_kw,demand_limit_kw,\
                      phase,application_state,curtailed,estimated_reduction_kw,shed_kw,above_limit";

/// Exports tick records to a CSV file at the given path.
///
/// # Errors
///
/// Returns an `io::Error` if file creation or writing fails.
pub fn export_csv(results: &[TickRecord], path: &Path) -> io::Result<()> {
    let file = File::create(path)?;
    let buf = io::BufWriter::new(file);
    write_csv(results, buf)
}

/// Writes tick records as CSV to any writer.
///
/// An absent demand limit is written as an empty field.
///
/// # Errors
///
/// Returns an `io::Error` if writing fails.
pub fn write_csv(results: &[TickRecord], writer: impl Write) -> io::Result<()> {
    let mut wtr = csv::WriterBuilder::new().from_writer(writer);

    wtr.write_record(HEADER.split(',').map(str::trim))?;

    for r in results {
        wtr.write_record(&[
            r.step.to_string(),
            format!("{:.2}", r.time_min),
            format!("{:.4}", r.power_kw),
            format!("{:.4}", r.load_control_kw),
            format!("{:.4}", r.average_kw),
            r.demand_limit_kw.map(|l| format!("{l:.4}")).unwrap_or_default(),
            r.phase.to_string(),
            format!("{:?}", r.application_state),
            r.curtailed.to_string(),
            format!("{:.4}", r.estimated_reduction_kw),
            format!("{:.4}", r.shed_kw),
            r.above_limit().to_string(),
        ])?;
    }

    wtr.flush()?;
    Ok(())
}
