//! Length-prefixed JSON framing used between the Index Writer's coordinator
//! and an extraction worker process (§5: "process isolation, not threads").
//!
//! Wire format: a 4-byte big-endian length prefix followed by that many
//! bytes of UTF-8 JSON. Used identically on both ends of the pipe.

use std::collections::HashMap;
use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::ExtractionFacade;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub sha256: String,
    pub path: String,
    pub doctype: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub sha256: String,
    pub text: String,
    pub metadata: HashMap<String, JsonValue>,
    pub skip_reason: Option<String>,
}

pub fn write_message<W: Write, T: Serialize>(out: &mut W, value: &T) -> io::Result<()> {
    let bytes = serde_json::to_vec(value)?;
    out.write_all(&(bytes.len() as u32).to_be_bytes())?;
    out.write_all(&bytes)?;
    out.flush()
}

/// Returns `Ok(None)` on a clean EOF before any bytes of a new message.
pub fn read_message<R: Read, T: for<'de> Deserialize<'de>>(input: &mut R) -> io::Result<Option<T>> {
    let mut len_buf = [0u8; 4];
    match input.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    input.read_exact(&mut body)?;
    let value = serde_json::from_slice(&body)?;
    Ok(Some(value))
}

/// Runs the worker side of the protocol: reads jobs from `input` until EOF,
/// extracts each with `facade`, and writes the outcome to `output`. Intended
/// to be the entire body of a worker process's `main`.
pub fn run_worker_loop<R: Read, W: Write>(
    facade: &ExtractionFacade,
    mut input: R,
    mut output: W,
) -> io::Result<()> {
    loop {
        let job: Job = match read_message(&mut input)? {
            Some(j) => j,
            None => return Ok(()),
        };

        let meta = ediscovery_discovery::DocumentMetadata {
            sha256: job.sha256.clone(),
            path: job.path.into(),
            size_bytes: 0,
            mtime: chrono::Utc::now(),
            custodian: None,
            doctype: job.doctype,
        };
        let result = facade.extract(&meta);
        let outcome = Outcome {
            sha256: job.sha256,
            text: result.text,
            metadata: result.metadata,
            skip_reason: result.skip_reason,
        };
        write_message(&mut output, &outcome)?;
    }
}
