//! Dumps a statfile's header and section layout for manual inspection.
//!
//! Not part of the library's public surface — ambient CLI glue, in the
//! spirit of the kind of small `admin`-style binary a storage crate ships
//! alongside its library for operators to poke at a file by hand.
use std::path::PathBuf;

use statfile_engine::format::{self, header, section, BLOCK_SIZE, HEADER_SIZE, SECTION_HEADER_SIZE};

fn main() {
    let mut args = std::env::args_os().skip(1);
    let path = match args.next() {
        Some(p) => PathBuf::from(p),
        None => {
            eprintln!("usage: cat_statfile <path>");
            std::process::exit(2);
        }
    };

    let bytes = match std::fs::read(&path) {
        Ok(b) => b,
        Err(e) => {
            eprintln!("{}: {e}", path.display());
            std::process::exit(1);
        }
    };

    if bytes.len() < HEADER_SIZE {
        eprintln!("{}: too small to be a statfile ({} bytes)", path.display(), bytes.len());
        std::process::exit(1);
    }

    let magic = header::magic(&bytes);
    let version = header::version(&bytes);
    println!("path:         {}", path.display());
    println!("magic:        {:?} ({})", magic, String::from_utf8_lossy(&magic));
    println!("version:      {:?}", version);
    println!("create_time:  {}", header::create_time(&bytes));
    println!("revision:     {}", header::revision(&bytes));
    println!("rev_time:     {}", header::rev_time(&bytes));
    println!("used_blocks:  {}", header::used_blocks(&bytes));
    println!("total_blocks: {}", header::total_blocks(&bytes));

    println!("sections:");
    let mut offset = HEADER_SIZE;
    while offset + SECTION_HEADER_SIZE <= bytes.len() {
        let sect = &bytes[offset..offset + SECTION_HEADER_SIZE];
        let code = section::code(sect);
        let length = section::length(sect);
        let name = match code {
            format::SECTION_COMMON => "common",
            format::SECTION_HEADERS => "headers",
            format::SECTION_URLS => "urls",
            format::SECTION_REGEXP => "regexp",
            _ => "unknown",
        };
        println!("  code={code} ({name}) length={length} blocks");
        let span = SECTION_HEADER_SIZE + length as usize * BLOCK_SIZE;
        if span == 0 {
            break;
        }
        offset += span;
    }
}
