//! TensorBoard event files
//!
//! Layout follows the usual `lightning_logs/version_<n>/` convention: one
//! `events.out.tfevents.*` TFRecord file of scalar summaries plus
//! `hparams.yaml`.

use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use super::{Metrics, TrainLogger};
use crate::config::TensorBoardConfig;

const DEFAULT_NAME: &str = "lightning_logs";
const FILE_VERSION: &str = "brain.Event:2";

pub struct TensorBoardLogger {
    root: PathBuf,
    version_dir: Option<PathBuf>,
    writer: Option<BufWriter<File>>,
}

impl TensorBoardLogger {
    pub fn new(save_dir: &Path, options: &TensorBoardConfig) -> Self {
        let name = options.name.as_deref().unwrap_or(DEFAULT_NAME);
        Self {
            root: save_dir.join(name),
            version_dir: None,
            writer: None,
        }
    }

    /// `version_<n>` directory, created on first use.
    pub fn log_dir(&mut self) -> Result<PathBuf> {
        if let Some(dir) = &self.version_dir {
            return Ok(dir.clone());
        }
        let version = next_version(&self.root)?;
        let dir = self.root.join(format!("version_{}", version));
        fs::create_dir_all(&dir).with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
        self.version_dir = Some(dir.clone());
        Ok(dir)
    }

    fn writer(&mut self) -> Result<&mut BufWriter<File>> {
        if self.writer.is_none() {
            let dir = self.log_dir()?;
            let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
            let path = dir.join(format!("events.out.tfevents.{}.{}", now.as_secs(), hostname()));
            let file = File::create(&path).with_context(|| format!("Failed to create {}", path.display()))?;
            let mut writer = BufWriter::new(file);
            write_record(&mut writer, &encode_file_version_event(wall_time()))?;
            self.writer = Some(writer);
        }
        self.writer
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("event writer is not open"))
    }
}

impl TrainLogger for TensorBoardLogger {
    fn name(&self) -> &str {
        "tensorboard"
    }

    fn log_hyperparams(&mut self, params: &serde_json::Value) -> Result<()> {
        let path = self.log_dir()?.join("hparams.yaml");
        let yaml = serde_yaml::to_string(params)?;
        fs::write(&path, yaml).with_context(|| format!("Failed to write {}", path.display()))
    }

    fn log_metrics(&mut self, metrics: &Metrics, step: usize) -> Result<()> {
        if metrics.is_empty() {
            return Ok(());
        }
        let event = encode_scalars_event(wall_time(), step as i64, metrics);
        let writer = self.writer()?;
        write_record(writer, &event)?;
        writer.flush()?;
        Ok(())
    }

    fn finalize(&mut self, status: &str) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        log::debug!("TensorBoard logger finished with status {}", status);
        Ok(())
    }
}

fn next_version(root: &Path) -> Result<usize> {
    if !root.is_dir() {
        return Ok(0);
    }
    let mut next = 0;
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        if !entry.path().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some(n) = name.strip_prefix("version_").and_then(|n| n.parse::<usize>().ok()) {
            next = next.max(n + 1);
        }
    }
    Ok(next)
}

fn wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Masked CRC-32C stored in TFRecord files.
pub fn masked_crc32c(data: &[u8]) -> u32 {
    let crc = crc32c::crc32c(data);
    ((crc >> 15) | (crc << 17)).wrapping_add(0xA282_EAD8)
}

/// TFRecord framing: length, masked CRC of the length, data, masked CRC of the data.
pub fn write_record<W: Write>(writer: &mut W, data: &[u8]) -> Result<()> {
    let len = (data.len() as u64).to_le_bytes();
    writer.write_all(&len)?;
    writer.write_all(&masked_crc32c(&len).to_le_bytes())?;
    writer.write_all(data)?;
    writer.write_all(&masked_crc32c(data).to_le_bytes())?;
    Ok(())
}

// Minimal protobuf encoding of tensorflow.Event and tensorflow.Summary

fn put_varint(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8 & 0x7F) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

fn put_bytes(buf: &mut Vec<u8>, field: u32, bytes: &[u8]) {
    put_varint(buf, ((field << 3) | 2) as u64);
    put_varint(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

fn event_header(wall_time: f64, step: i64) -> Vec<u8> {
    let mut buf = Vec::new();
    // wall_time: double, field 1
    buf.push(0x09);
    buf.extend_from_slice(&wall_time.to_le_bytes());
    // step: int64, field 2
    if step != 0 {
        buf.push(0x10);
        put_varint(&mut buf, step as u64);
    }
    buf
}

pub fn encode_file_version_event(wall_time: f64) -> Vec<u8> {
    let mut buf = event_header(wall_time, 0);
    put_bytes(&mut buf, 3, FILE_VERSION.as_bytes());
    buf
}

pub fn encode_scalars_event(wall_time: f64, step: i64, metrics: &Metrics) -> Vec<u8> {
    let mut summary = Vec::new();
    for (tag, value) in metrics {
        let mut entry = Vec::new();
        put_bytes(&mut entry, 1, tag.as_bytes());
        // simple_value: float, field 2
        entry.push(0x15);
        entry.extend_from_slice(&(*value as f32).to_le_bytes());
        put_bytes(&mut summary, 1, &entry);
    }

    let mut buf = event_header(wall_time, step);
    put_bytes(&mut buf, 5, &summary);
    buf
}
