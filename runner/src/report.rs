use crate::{
    buffer::{ResultBuffer, Slot},
    job::Job,
};
use std::{
    collections::BTreeSet,
    fmt::Write as _,
    fs,
    io,
    path::{Path, PathBuf},
};
use tracing::info;

pub const MATRIX_FILE: &str = "results.csv";

fn escape(field: &str) -> String {
    if field.contains(&[',', '"', '\n'][..]) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_owned()
    }
}

/// Render the result matrix as CSV, one row per job in id order
///
/// Columns are `id`, every parameter name, the requested metrics and `status`.
/// Cells without a value are written as `NaN`.
pub fn render_matrix(jobs: &[Job], buffer: &ResultBuffer, metrics: &[String]) -> String {
    let parameters = jobs
        .iter()
        .flat_map(|job| job.parameters.keys())
        .collect::<BTreeSet<_>>();

    let mut out = String::new();
    let header = std::iter::once("id")
        .chain(parameters.iter().map(|name| name.as_str()))
        .chain(metrics.iter().map(String::as_str))
        .chain(std::iter::once("status"))
        .map(escape)
        .collect::<Vec<_>>();
    out.push_str(&header.join(","));
    out.push('\n');

    for job in jobs {
        let mut row = vec![job.id.to_string()];

        for name in parameters.iter() {
            row.push(job.parameters.get(*name).copied().unwrap_or(f64::NAN).to_string());
        }

        let (values, status) = match buffer.slot(job.id) {
            Some(Slot::Done(values)) => (Some(values), "success"),
            Some(Slot::Failed(_)) => (None, "failure"),
            Some(Slot::Missing) | None => (None, "missing"),
        };
        for metric in metrics {
            let value = values
                .and_then(|values| values.get(metric))
                .copied()
                .unwrap_or(f64::NAN);
            row.push(value.to_string());
        }
        row.push(status.to_owned());

        let _ = writeln!(out, "{}", row.join(","));
    }

    out
}

/// Write `<output>/results.csv`, returns the written path
pub fn write_matrix(
    output: &Path,
    jobs: &[Job],
    buffer: &ResultBuffer,
    metrics: &[String],
) -> io::Result<PathBuf> {
    fs::create_dir_all(output)?;
    let path = output.join(MATRIX_FILE);

    fs::write(&path, render_matrix(jobs, buffer, metrics))?;
    info!(rows = jobs.len(), "Wrote result matrix to {}", path.to_string_lossy());

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobResult, Metrics, Parameters};

    #[test]
    fn renders_missing_and_failed_cells_as_nan() {
        let jobs = (0..3)
            .map(|id| {
                Job::new(
                    id,
                    Parameters::from([
                        ("wall".to_owned(), id as f64 / 2.0),
                        ("roof".to_owned(), 1.0),
                    ]),
                )
            })
            .collect::<Vec<_>>();
        let mut buffer = ResultBuffer::new(3);
        buffer
            .record(JobResult::success(
                0,
                Metrics::from([("elec".to_owned(), 12.5), ("gas".to_owned(), 3.0)]),
            ))
            .unwrap();
        buffer.record(JobResult::failure(1, "crashed")).unwrap();

        let csv = render_matrix(&jobs, &buffer, &["elec".to_owned(), "gas".to_owned()]);

        assert_eq!(
            csv,
            "id,roof,wall,elec,gas,status\n\
             0,1,0,12.5,3,success\n\
             1,1,0.5,NaN,NaN,failure\n\
             2,1,1,NaN,NaN,missing\n"
        );
    }

    #[test]
    fn odd_names_are_quoted() {
        assert_eq!(escape("a,b"), "\"a,b\"");
        assert_eq!(escape("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(escape("elec"), "elec");
    }

    #[test]
    fn writes_into_the_output_directory() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out");

        let path = write_matrix(&output, &[], &ResultBuffer::new(0), &["elec".to_owned()]).unwrap();

        assert_eq!(path, output.join(MATRIX_FILE));
        assert_eq!(fs::read_to_string(path).unwrap(), "id,elec,status\n");
    }
}
