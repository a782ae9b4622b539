//! Intel HEX encode/decode for the program image.
//!
//! The hex stream is byte-addressed; image locations are 16-bit words, two
//! bytes each in little-endian order, so word address = byte address / 2.

use std::path::Path;

use anyhow::Result;
use ihex::Record;

use crate::memory::{ErasedPattern, MemoryImage};

pub fn read_hex_file<P: AsRef<Path>>(path: P, erased: ErasedPattern) -> Result<MemoryImage> {
    let p = path.as_ref();
    let raw = std::fs::read_to_string(p)?;
    let image = read_ihex(&raw, erased)?;
    log::info!(
        "read {} filled locations from {}",
        image.filled_count(),
        p.display()
    );
    Ok(image)
}

pub fn read_ihex(data: &str, erased: ErasedPattern) -> Result<MemoryImage> {
    let mut image = MemoryImage::new(erased);
    let mut base_address = 0u32;

    for record in ihex::Reader::new(data) {
        match record? {
            Record::Data { offset, value } => {
                let offset = base_address + offset as u32;
                for (i, &byte) in value.iter().enumerate() {
                    image.set_byte(offset + i as u32, byte);
                }
            }
            Record::EndOfFile => (),
            Record::ExtendedSegmentAddress(address) => {
                base_address = (address as u32) * 16;
            }
            Record::ExtendedLinearAddress(address) => {
                base_address = (address as u32) << 16;
            }
            Record::StartSegmentAddress { .. } | Record::StartLinearAddress(_) => (),
        }
    }
    Ok(image)
}

pub fn write_hex_file<P: AsRef<Path>>(image: &MemoryImage, path: P) -> Result<()> {
    let p = path.as_ref();
    let text = write_ihex(image)?;
    std::fs::write(p, text)?;
    log::info!(
        "wrote {} filled locations to {}",
        image.filled_count(),
        p.display()
    );
    Ok(())
}

/// Encode the filled locations as Intel HEX: contiguous words are grouped
/// into 16-byte data records, with extended linear address records at each
/// 64 KiB byte-address boundary.
pub fn write_ihex(image: &MemoryImage) -> Result<String> {
    let mut records = Vec::new();
    let mut upper = 0u16;
    let mut run_start: Option<u32> = None;
    let mut run: Vec<u8> = Vec::new();

    let mut flush = |records: &mut Vec<Record>, start: &mut Option<u32>, run: &mut Vec<u8>| {
        if let Some(byte_addr) = start.take() {
            records.push(Record::Data {
                offset: (byte_addr & 0xFFFF) as u16,
                value: std::mem::take(run),
            });
        }
    };

    for (addr, word) in image.iter_filled() {
        let byte_addr = addr * 2;
        let word_upper = (byte_addr >> 16) as u16;

        let contiguous = match run_start {
            Some(start) => start + run.len() as u32 == byte_addr,
            None => false,
        };
        let crosses = (byte_addr & 0xFFFF) == 0 && !run.is_empty();
        if !contiguous || run.len() >= 16 || crosses {
            flush(&mut records, &mut run_start, &mut run);
        }
        if word_upper != upper {
            flush(&mut records, &mut run_start, &mut run);
            records.push(Record::ExtendedLinearAddress(word_upper));
            upper = word_upper;
        }
        if run_start.is_none() {
            run_start = Some(byte_addr);
        }
        run.push((word & 0xFF) as u8);
        run.push((word >> 8) as u8);
    }
    flush(&mut records, &mut run_start, &mut run);
    records.push(Record::EndOfFile);

    Ok(ihex::create_object_file_representation(&records)?)
}
