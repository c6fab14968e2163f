use std::collections::BTreeMap;
use std::path::PathBuf;

use tether::data_model::{LocalSeq, PendingWrite, WriteState};
use tether::journal::{JOURNAL_HEADER_LEN, JournalRecord, parse_journal_records};

fn main() {
    env_logger::init();
    let args: Vec<String> = std::env::args().collect();

    if args.len() != 2 {
        eprintln!("Usage: {} <path-to-journal-file>", args[0]);
        eprintln!("\nExample: {} ./tether.journal", args[0]);
        std::process::exit(1);
    }

    let file_path = PathBuf::from(&args[1]);
    let bytes = match std::fs::read(&file_path) {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!("Error reading file '{}': {}", file_path.display(), e);
            std::process::exit(1);
        }
    };

    println!("TetherScope - Write Journal Analyzer");
    println!("====================================");
    println!("File: {}", file_path.display());
    println!(
        "Size: {} bytes ({:.2} KB)",
        bytes.len(),
        bytes.len() as f64 / 1024.0
    );
    println!();

    let (records, valid_len) = parse_journal_records(&bytes);
    if valid_len == 0 {
        println!("  Invalid or empty journal (header is {JOURNAL_HEADER_LEN} bytes)");
        std::process::exit(1);
    }
    if valid_len < bytes.len() {
        println!(
            "  ⚠️  {} trailing bytes do not form a complete record (torn append?)",
            bytes.len() - valid_len
        );
        println!();
    }

    println!("Records:");
    println!("--------");
    println!("  Total parsed records: {}", records.len());
    println!();

    let mut writes: BTreeMap<LocalSeq, PendingWrite> = BTreeMap::new();
    let mut checkpoint = 0;
    let mut last_seq: Option<LocalSeq> = None;
    let mut problems = 0;

    for (i, record) in records.iter().enumerate() {
        match record {
            JournalRecord::Checkpoint { next_seq } => {
                println!("  {i:>5}  checkpoint   next seq {next_seq}");
                if next_seq.0 < checkpoint {
                    println!("         ❌ checkpoint went backwards (was {checkpoint})");
                    problems += 1;
                }
                checkpoint = next_seq.0;
            }
            JournalRecord::Append(write) => {
                println!(
                    "  {i:>5}  append       {} {} {} at {}",
                    write.local_seq,
                    write.mutation.kind(),
                    write.path,
                    write.submitted_at
                );
                if last_seq.is_some_and(|last| write.local_seq <= last) {
                    println!("         ❌ seq is not greater than the previous append");
                    problems += 1;
                }
                if write.local_seq.0 < checkpoint {
                    println!("         ❌ seq was already handed out before checkpoint {checkpoint}");
                    problems += 1;
                }
                last_seq = Some(write.local_seq);
                writes.insert(write.local_seq, write.clone());
            }
            JournalRecord::Transition { seq, state } => {
                println!("  {i:>5}  transition   {seq} -> {state:?}");
                match writes.get_mut(seq) {
                    Some(write) => write.state = *state,
                    None => {
                        println!("         ⚠️  transition for a write with no append");
                        problems += 1;
                    }
                }
            }
        }
    }

    println!();
    println!("Writes by path:");
    println!("---------------");
    let mut by_path: BTreeMap<String, Vec<&PendingWrite>> = BTreeMap::new();
    for write in writes.values() {
        by_path.entry(write.path.to_string()).or_default().push(write);
    }
    for (path, writes) in &by_path {
        println!("  {path}");
        for write in writes {
            let preview = serde_json::to_string(&write.mutation)
                .unwrap_or_else(|_| "Invalid JSON".to_string());
            let preview = if preview.len() > 80 {
                let mut end = 80;
                while !preview.is_char_boundary(end) && end > 0 {
                    end -= 1;
                }
                format!("{}...", &preview[..end])
            } else {
                preview
            };
            println!("    {} {:?}: {preview}", write.local_seq, write.state);
        }
    }

    let pending = writes.values().filter(|write| !write.state.is_terminal()).count();
    let sent = writes
        .values()
        .filter(|write| write.state == WriteState::Sent)
        .count();

    println!();
    println!("Summary:");
    println!("--------");
    println!("  Writes seen: {}", writes.len());
    println!("  Still pending: {pending} ({sent} sent without an answer)");
    if problems == 0 {
        println!("  ✅ Seqs are strictly increasing and every transition has an append");
    } else {
        println!("  ❌ {problems} problems found");
    }
}
