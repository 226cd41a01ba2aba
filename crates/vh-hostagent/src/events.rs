//! Status event emission

use std::io::Write;
use std::sync::Mutex;

use chrono::Utc;
use vh_protocol::{Event, Status};

struct Sink {
    out: Box<dyn Write + Send>,
    running_sent: bool,
    exiting_sent: bool,
}

/// Serializes status events to the supervisor, one JSON object per line
///
/// Concurrent emitters are serialized by one lock. The stream is kept
/// well-formed: at most one running event, and nothing after exiting.
pub struct EventEmitter {
    sink: Mutex<Sink>,
}

impl EventEmitter {
    pub fn new(out: impl Write + Send + 'static) -> Self {
        Self {
            sink: Mutex::new(Sink {
                out: Box::new(out),
                running_sent: false,
                exiting_sent: false,
            }),
        }
    }

    /// Emitter writing to stdout
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }

    /// Emit `event`, stamping it with the current time if unset
    pub fn emit(&self, mut event: Event) {
        let mut sink = match self.sink.lock() {
            Ok(sink) => sink,
            Err(poisoned) => poisoned.into_inner(),
        };

        if sink.exiting_sent {
            tracing::warn!("Dropping status event after exiting: {:?}", event.status);
            return;
        }
        if event.status.running && !event.status.exiting {
            if sink.running_sent {
                tracing::warn!("Dropping duplicate running event");
                return;
            }
            sink.running_sent = true;
        }
        if event.status.exiting {
            sink.exiting_sent = true;
        }

        if event.time.is_none() {
            event.time = Some(Utc::now());
        }
        tracing::debug!("Emitting status event: {:?}", event.status);

        if let Err(e) = write_line(&mut sink.out, &event) {
            tracing::error!("Failed to write status event: {}", e);
        }
    }

    /// Emit a status with the current time
    pub fn emit_status(&self, status: Status) {
        self.emit(Event::new(status));
    }
}

fn write_line(out: &mut dyn Write, event: &Event) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(event)?;
    line.push(b'\n');
    out.write_all(&line)?;
    out.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct Shared(Arc<Mutex<Vec<u8>>>);

    impl Write for Shared {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn lines(buf: &Shared) -> Vec<Event> {
        let data = buf.0.lock().unwrap();
        String::from_utf8_lossy(&data)
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn test_emit_fills_time() {
        let buf = Shared::default();
        let emitter = EventEmitter::new(buf.clone());
        emitter.emit_status(Status::default());

        let events = lines(&buf);
        assert_eq!(events.len(), 1);
        assert!(events[0].time.is_some());
    }

    #[test]
    fn test_emit_keeps_explicit_time() {
        let buf = Shared::default();
        let emitter = EventEmitter::new(buf.clone());
        let time = Utc::now() - chrono::Duration::hours(1);
        emitter.emit(Event {
            time: Some(time),
            status: Status::default(),
        });
        assert_eq!(lines(&buf)[0].time, Some(time));
    }

    #[test]
    fn test_single_running_and_nothing_after_exiting() {
        let buf = Shared::default();
        let emitter = EventEmitter::new(buf.clone());
        let running = Status {
            running: true,
            ..Default::default()
        };

        emitter.emit_status(Status::default());
        emitter.emit_status(running.clone());
        emitter.emit_status(running);
        emitter.emit_status(Status {
            exiting: true,
            ..Default::default()
        });
        emitter.emit_status(Status::default());

        let events = lines(&buf);
        assert_eq!(events.len(), 3);
        assert!(events[1].status.running);
        assert!(events[2].status.exiting);
    }
}
