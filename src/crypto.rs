use std::fs::File;
use std::io;
use std::ops::Range;

use log::debug;

use crate::subprocess::{ChildIo, Subprocess};

/// Terminator line the encryption tool emits after every armored message.
pub const TERMINATOR: &[u8] = b"-----END PGP MESSAGE-----\n";

const CHUNK_SIZE: usize = 1 << 20;

/// Split a backing file's contents into adjacent single-message ranges.
///
/// The tool refuses to process several concatenated messages in one
/// invocation, so each range is handed to its own child. The final range may
/// lack a terminator and is yielded anyway.
pub fn split_blocks(data: &[u8]) -> Vec<Range<usize>> {
    let mut blocks = Vec::new();
    let mut offset = 0;
    while offset < data.len() {
        let end = match find_terminator(&data[offset..]) {
            Some(pos) => offset + pos + TERMINATOR.len(),
            None => data.len(),
        };
        blocks.push(offset..end);
        offset = end;
    }
    blocks
}

fn find_terminator(data: &[u8]) -> Option<usize> {
    if data.len() < TERMINATOR.len() {
        return None;
    }
    data.windows(TERMINATOR.len()).position(|w| w == TERMINATOR)
}

/// The external encryption tool, invoked as a child process.
///
/// Only the binary is configurable; the flags and the `-r` recipient
/// arguments are the tool's wire contract.
pub struct GpgTool {
    binary: String,
}

impl GpgTool {
    pub fn new(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }

    fn decrypt_argv(&self) -> Vec<String> {
        vec![
            self.binary.clone(),
            "-d".to_string(),
            "--no-tty".to_string(),
            "--batch".to_string(),
        ]
    }

    fn encrypt_argv(&self, recipients: &[String]) -> Vec<String> {
        let mut argv = vec![
            self.binary.clone(),
            "-ae".to_string(),
            "--no-tty".to_string(),
            "--batch".to_string(),
        ];
        for recipient in recipients {
            argv.push("-r".to_string());
            argv.push(recipient.clone());
        }
        argv
    }

    /// Decrypt one message supplied as bytes, appending plaintext to `out`.
    pub fn decrypt(&self, block: &[u8], out: &mut Vec<u8>) -> io::Result<()> {
        debug!("decrypt: {} ciphertext bytes via pipe", block.len());
        let mut child = Subprocess::spawn(&self.decrypt_argv(), ChildIo::Pipe, ChildIo::Pipe)?;
        self.pump_plaintext(&mut child, block, out)
    }

    /// Decrypt a whole single-message file by donating its descriptor as the
    /// child's stdin. The donated descriptor shares the caller's file
    /// offset; restoring it afterwards is the caller's job.
    pub fn decrypt_fd(&self, ciphertext: File, out: &mut Vec<u8>) -> io::Result<()> {
        debug!("decrypt: donated fd");
        let mut child =
            Subprocess::spawn(&self.decrypt_argv(), ChildIo::Fd(ciphertext), ChildIo::Pipe)?;
        self.pump_plaintext(&mut child, &[], out)
    }

    fn pump_plaintext(
        &self,
        child: &mut Subprocess,
        mut input: &[u8],
        out: &mut Vec<u8>,
    ) -> io::Result<()> {
        let mut chunk = vec![0u8; CHUNK_SIZE];
        loop {
            let (read, written) = child.communicate(&mut chunk, input)?;
            out.extend_from_slice(&chunk[..read]);
            input = &input[written..];
            if read == 0 {
                break;
            }
        }
        self.check_exit(child, "-d")
    }

    /// Encrypt `plaintext` for `recipients`, with the child's stdout routed
    /// straight to `dest` (normally the backing file's descriptor).
    pub fn encrypt(&self, plaintext: &[u8], recipients: &[String], dest: File) -> io::Result<()> {
        debug!(
            "encrypt: {} plaintext bytes for {} recipient(s)",
            plaintext.len(),
            recipients.len()
        );
        let mut child =
            Subprocess::spawn(&self.encrypt_argv(recipients), ChildIo::Pipe, ChildIo::Fd(dest))?;
        let mut input = plaintext;
        loop {
            let (_, written) = child.communicate(&mut [], input)?;
            input = &input[written..];
            if input.is_empty() || written == 0 {
                break;
            }
        }
        self.check_exit(&mut child, "-ae")
    }

    fn check_exit(&self, child: &mut Subprocess, mode: &str) -> io::Result<()> {
        let status = child.wait()?;
        if status.success() {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::Other,
                format!("{} {} exited with {}", self.binary, mode, status),
            ))
        }
    }
}
