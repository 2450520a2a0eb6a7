// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! memfab-doctor - inspect and recover memfab shared memory segments
//!
//! The recovery operator's front-end: list segments, inspect headers and
//! counters, diagnose slots, release zombie state, sweep dead consumers,
//! and verify or repair integrity. Forced operations are destructive and
//! gated behind explicit flags.

use clap::{Parser, Subcommand};
use colored::*;
use memfab::{scan_segments, Doctor, ForceResetOpts, SlotDiagnostic};

/// Inspect and recover memfab shared memory segments
#[derive(Parser, Debug)]
#[command(name = "memfab-doctor")]
#[command(version)]
#[command(about = "Inspect and recover memfab shared memory segments")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List fabric segments present in /dev/shm
    List,

    /// Show header, layout, and counters of a segment
    Inspect {
        /// Segment name (with leading /)
        name: String,
    },

    /// Diagnose slot coordination state
    Slots {
        /// Segment name
        name: String,
        /// Show every slot, not only suspicious ones
        #[arg(short = 'v', long)]
        verbose: bool,
    },

    /// Reset one slot's coordination state (generation is preserved)
    ResetSlot {
        /// Segment name
        name: String,
        /// Slot index
        index: u32,
        /// Reset even while the slot appears busy (destructive)
        #[arg(long)]
        force: bool,
    },

    /// Release a write lock held by a dead process
    ReleaseWriter {
        /// Segment name
        name: String,
        /// Slot index
        index: u32,
    },

    /// Zero a slot's reader count (destructive, requires --force)
    ReleaseReaders {
        /// Segment name
        name: String,
        /// Slot index
        index: u32,
        /// Acknowledge that live readers lose their accounting
        #[arg(long)]
        force: bool,
    },

    /// Free consumer rows with dead pids or stale heartbeats
    Sweep {
        /// Segment name
        name: String,
        /// Staleness threshold in milliseconds
        #[arg(long, default_value_t = 30_000)]
        stale_ms: u64,
    },

    /// Verify segment integrity; optionally repair checksums
    Verify {
        /// Segment name
        name: String,
        /// Recompute and store mismatched checksums over current bytes
        #[arg(long)]
        repair: bool,
    },
}

fn main() {
    let args = Args::parse();
    if let Err(e) = run(&args.command) {
        eprintln!("{}: {e}", "Error".red().bold());
        std::process::exit(1);
    }
}

fn run(command: &Command) -> memfab::Result<()> {
    match command {
        Command::List => {
            let segments = scan_segments();
            if segments.is_empty() {
                println!("{}", "No memfab segments found".yellow());
                return Ok(());
            }
            for name in segments {
                match Doctor::attach(&name) {
                    Ok(doctor) => {
                        let layout = doctor.layout();
                        println!(
                            "{}  {} slots x {} B, total {} B",
                            name.green(),
                            layout.slot_count,
                            layout.slot_stride,
                            layout.total_size
                        );
                    }
                    Err(e) => println!("{}  {}", name.red(), e),
                }
            }
            Ok(())
        }

        Command::Inspect { name } => {
            let doctor = Doctor::attach(name)?;
            print_inspect(name, &doctor);
            Ok(())
        }

        Command::Slots { name, verbose } => {
            let doctor = Doctor::attach(name)?;
            let slots = doctor.diagnose_all_slots()?;
            let mut shown = 0;
            for diag in &slots {
                let suspicious = diag.has_zombie_writer() || diag.reader_count > 0;
                if *verbose || suspicious {
                    print_slot(diag);
                    shown += 1;
                }
            }
            if shown == 0 {
                println!("{} ({} slots quiet)", "No suspicious slots".green(), slots.len());
            }
            Ok(())
        }

        Command::ResetSlot { name, index, force } => {
            let doctor = Doctor::attach(name)?;
            doctor.force_reset_slot(*index, ForceResetOpts { force: *force })?;
            println!("{} slot {index} reset", "OK".green().bold());
            Ok(())
        }

        Command::ReleaseWriter { name, index } => {
            let doctor = Doctor::attach(name)?;
            if doctor.release_zombie_writer(*index)? {
                println!("{} zombie write lock released", "OK".green().bold());
            } else {
                println!("{}", "Write lock is free or its holder is alive".yellow());
            }
            Ok(())
        }

        Command::ReleaseReaders { name, index, force } => {
            let doctor = Doctor::attach(name)?;
            let cleared = doctor.release_zombie_readers(*index, *force)?;
            println!("{} cleared {cleared} reader(s)", "OK".green().bold());
            Ok(())
        }

        Command::Sweep { name, stale_ms } => {
            let doctor = Doctor::attach(name)?;
            let freed = doctor.cleanup_dead_consumers(stale_ms * 1_000_000);
            println!("{} freed {freed} consumer row(s)", "OK".green().bold());
            Ok(())
        }

        Command::Verify { name, repair } => {
            let doctor = Doctor::attach(name)?;
            let report = doctor.validate_integrity(*repair)?;
            if report.is_ok() && report.repaired == 0 {
                println!("{} segment verifies clean", "OK".green().bold());
            } else if *repair {
                println!(
                    "{} {} checksum(s) recomputed",
                    "REPAIRED".yellow().bold(),
                    report.repaired
                );
            } else {
                println!("{}", "INTEGRITY FAILURES".red().bold());
                if !report.flex_ok {
                    println!("  flexible zone checksum mismatch");
                }
                for slot in &report.bad_slots {
                    println!("  slot {slot} checksum mismatch");
                }
                std::process::exit(2);
            }
            Ok(())
        }
    }
}

fn print_inspect(name: &str, doctor: &Doctor) {
    let header = doctor.header();
    let layout = doctor.layout();
    let counters = doctor.counters();
    let (producer_pid, producer_alive) = {
        let pid = header
            .producer_pid
            .load(std::sync::atomic::Ordering::Acquire);
        (pid, memfab::platform::is_process_alive(pid))
    };

    println!("{}", name.bold());
    println!("  magic/version     {:#010x} v{}", header.magic, header.version);
    println!(
        "  policy            {:?} / {:?} / checksums {:?}",
        header.data_block_policy().ok(),
        header.sync_policy().ok(),
        header.checksum_policy().ok()
    );
    println!(
        "  layout            {} slots x {} B, flex {} B, total {} B",
        layout.slot_count, layout.slot_stride, layout.flex_zone_size, layout.total_size
    );
    println!(
        "  indices           write={} commit={}",
        header
            .write_index
            .load(std::sync::atomic::Ordering::Acquire),
        header
            .commit_index
            .load(std::sync::atomic::Ordering::Acquire)
    );
    println!(
        "  producer          pid {} ({})",
        producer_pid,
        if producer_alive {
            "alive".green()
        } else {
            "dead".red()
        }
    );

    let consumers: Vec<_> = header
        .consumers
        .iter()
        .enumerate()
        .filter(|(_, r)| {
            r.consumer_id.load(std::sync::atomic::Ordering::Acquire) != 0
        })
        .collect();
    println!("  consumers         {}", consumers.len());
    for (row, record) in consumers {
        let id = record.consumer_id.load(std::sync::atomic::Ordering::Acquire);
        println!(
            "    row {row}: id {:#x} pid {} cursor {}",
            id,
            memfab::header::ConsumerRecord::pid_of(id),
            record
                .last_read_index
                .load(std::sync::atomic::Ordering::Acquire)
        );
    }
    println!("  counters          {counters}");
}

fn print_slot(diag: &SlotDiagnostic) {
    let state = match diag.state {
        Some(s) => format!("{s:?}"),
        None => "CORRUPT".to_string(),
    };
    let writer_text = if diag.write_lock_pid == 0 {
        "-".to_string()
    } else if diag.writer_alive {
        format!("pid {}", diag.write_lock_pid)
    } else {
        format!("pid {} (dead)", diag.write_lock_pid)
    };
    let writer = if diag.has_zombie_writer() {
        writer_text.as_str().red()
    } else {
        writer_text.as_str().normal()
    };
    println!(
        "slot {:>4}  {:<9}  gen {:>6}  len {:>6}  readers {:>3}  writer {}  idle {} ms",
        diag.index,
        state,
        diag.generation,
        diag.payload_len,
        diag.reader_count,
        writer,
        diag.stuck_duration_ns / 1_000_000
    );
}
