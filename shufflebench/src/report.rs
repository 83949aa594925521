//! CSV reporting for shuffle rounds.
//!
//! One summary file collects a row per round; per-phase detail files hold
//! the full rank-by-round second matrices. I/O failures here are the
//! caller's to log; they must never reach the data path.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use shufflecast::metrics::RoundMetrics;

/// One summary row, in the column order of the report.
pub struct SummaryRow<'a> {
    pub method: &'a str,
    pub ranks: usize,
    pub aggregators: usize,
    pub data_size: usize,
    pub throttle: usize,
    pub repeats: usize,
    pub policy: &'a str,
    pub rank0: RoundMetrics,
    pub max: RoundMetrics,
}

/// Appends a row to the summary CSV, writing the header first when the file
/// does not exist yet.
pub fn append_summary(path: &Path, row: &SummaryRow<'_>) -> io::Result<()> {
    let fresh = !path.exists();
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    if fresh {
        writeln!(
            file,
            "method,ranks,aggregators,data_size,throttle,repeats,policy,\
             rank0_post,rank0_wait_send,rank0_wait_recv,rank0_total,\
             max_post,max_wait_send,max_wait_recv,max_total"
        )?;
    }
    let r0 = row.rank0.as_seconds();
    let mx = row.max.as_seconds();
    writeln!(
        file,
        "{},{},{},{},{},{},{},{:.6},{:.6},{:.6},{:.6},{:.6},{:.6},{:.6},{:.6}",
        row.method,
        row.ranks,
        row.aggregators,
        row.data_size,
        row.throttle,
        row.repeats,
        row.policy,
        r0[0],
        r0[1],
        r0[2],
        r0[4],
        mx[0],
        mx[1],
        mx[2],
        mx[4],
    )
}

const PHASES: [&str; 5] = ["post", "wait_send", "wait_recv", "barrier", "total"];

/// Writes the per-phase detail files for one method: rows are ranks,
/// columns are round indices, values are seconds.
pub fn write_details(dir: &Path, method: &str, series: &[Vec<RoundMetrics>]) -> io::Result<()> {
    for (phase, name) in PHASES.iter().enumerate() {
        let mut file = File::create(dir.join(format!("{method}_{name}.csv")))?;
        for rounds in series {
            let row: Vec<String> =
                rounds.iter().map(|m| format!("{:.6}", m.as_seconds()[phase])).collect();
            writeln!(file, "{}", row.join(","))?;
        }
    }
    Ok(())
}

/// Prints the round summary the way the console report reads.
pub fn print_summary(row: &SummaryRow<'_>) {
    println!("| --------------------------------------");
    println!("| {} rank 0 request post time = {:.6}", row.method, row.rank0.as_seconds()[0]);
    println!("| {} rank 0 send waitall time = {:.6}", row.method, row.rank0.as_seconds()[1]);
    println!("| {} rank 0 recv waitall time = {:.6}", row.method, row.rank0.as_seconds()[2]);
    println!("| {} rank 0 total time = {:.6}", row.method, row.rank0.as_seconds()[4]);
    println!("| {} max request post time = {:.6}", row.method, row.max.as_seconds()[0]);
    println!("| {} max send waitall time = {:.6}", row.method, row.max.as_seconds()[1]);
    println!("| {} max recv waitall time = {:.6}", row.method, row.max.as_seconds()[2]);
    println!("| {} max total time = {:.6}", row.method, row.max.as_seconds()[4]);
}
