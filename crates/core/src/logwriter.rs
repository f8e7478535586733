use std::io;

/// Receives one completed line of log output. Implemented by whatever sink
/// the embedder wants (stderr, `tracing`, a file).
pub trait Logger: Send + Sync {
	fn log(&self, msg: &str);
}

/// Adapts a [`Logger`] into an [`io::Write`] by buffering until a newline,
/// so it can be handed to anything that writes free-form log text a byte
/// at a time.
pub struct LogWriter<L: Logger> {
	logger: L,
	buf: Vec<u8>,
}

impl<L: Logger> LogWriter<L> {
	pub fn new(logger: L) -> Self {
		Self { logger, buf: Vec::new() }
	}
}

impl<L: Logger> io::Write for LogWriter<L> {
	fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
		// Buffer raw bytes rather than decoding per-byte: a multi-byte UTF-8
		// sequence can straddle two `write` calls, and UTF-8 continuation
		// bytes never collide with the `\n` delimiter, so it's safe to
		// decode only once a full line has accumulated.
		for &b in buf {
			if b == b'\n' {
				let line = String::from_utf8_lossy(&self.buf).into_owned();
				self.logger.log(&line);
				self.buf.clear();
			} else {
				self.buf.push(b);
			}
		}
		Ok(buf.len())
	}

	/// Emits whatever's buffered even without a trailing newline, so a
	/// partial line isn't lost when the writer is flushed or dropped.
	fn flush(&mut self) -> io::Result<()> {
		if !self.buf.is_empty() {
			let line = String::from_utf8_lossy(&self.buf).into_owned();
			self.logger.log(&line);
			self.buf.clear();
		}
		Ok(())
	}
}

impl<L: Logger> Drop for LogWriter<L> {
	fn drop(&mut self) {
		let _ = io::Write::flush(self);
	}
}

/// Logs through `tracing::debug!`, matching how the CLI wires up its
/// default logger.
pub struct TracingLogger;

impl Logger for TracingLogger {
	fn log(&self, msg: &str) {
		tracing::debug!(target: "squiggly::proxy", "{msg}");
	}
}

#[cfg(test)]
mod tests {
	use std::io::Write;
	use std::sync::{Arc, Mutex};

	use super::*;

	struct CollectingLogger(Arc<Mutex<Vec<String>>>);
	impl Logger for CollectingLogger {
		fn log(&self, msg: &str) {
			self.0.lock().unwrap().push(msg.to_string());
		}
	}

	#[test]
	fn buffers_until_newline() {
		let lines = Arc::new(Mutex::new(Vec::new()));
		let mut w = LogWriter::new(CollectingLogger(lines.clone()));
		w.write_all(b"hello ").unwrap();
		w.write_all(b"world\nsecond").unwrap();
		assert_eq!(*lines.lock().unwrap(), vec!["hello world".to_string()]);
		w.write_all(b" line\n").unwrap();
		assert_eq!(
			*lines.lock().unwrap(),
			vec!["hello world".to_string(), "second line".to_string()]
		);
	}

	#[test]
	fn flush_emits_partial_line() {
		let lines = Arc::new(Mutex::new(Vec::new()));
		let mut w = LogWriter::new(CollectingLogger(lines.clone()));
		w.write_all(b"no newline yet").unwrap();
		assert!(lines.lock().unwrap().is_empty());
		w.flush().unwrap();
		assert_eq!(*lines.lock().unwrap(), vec!["no newline yet".to_string()]);
	}

	#[test]
	fn drop_flushes_buffered_partial_line() {
		let lines = Arc::new(Mutex::new(Vec::new()));
		{
			let mut w = LogWriter::new(CollectingLogger(lines.clone()));
			w.write_all(b"unflushed").unwrap();
		}
		assert_eq!(*lines.lock().unwrap(), vec!["unflushed".to_string()]);
	}

	#[test]
	fn multi_byte_utf8_split_across_writes_is_not_corrupted() {
		let lines = Arc::new(Mutex::new(Vec::new()));
		let mut w = LogWriter::new(CollectingLogger(lines.clone()));
		// "café\n" with the 2-byte 'é' (0xC3 0xA9) split across two writes.
		w.write_all(&[b'c', b'a', b'f', 0xC3]).unwrap();
		w.write_all(&[0xA9, b'\n']).unwrap();
		assert_eq!(*lines.lock().unwrap(), vec!["café".to_string()]);
	}
}
