//! Producer/consumer pipelining for paginated readers.
//!
//! Each reader runs on its own thread and pushes whole pages into a bounded
//! channel. The consumer side is a plain iterator over rows, so the merge
//! stays single-threaded while fetches overlap with it. Memory is capped at
//! `depth` pages per side.

use crate::error::{ReconError, StreamSide};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::thread;
use std::time::Duration;

/// A source that hands out one page of rows per call, `None` once drained.
pub trait PageSource: Send + 'static {
    type Row: Send + 'static;

    fn next_page(&mut self) -> Result<Option<Vec<Self::Row>>, ReconError>;
}

enum Message<T> {
    Page(Vec<T>),
    End,
    Failed(ReconError),
}

pub struct Prefetched<T> {
    stream: StreamSide,
    rx: Receiver<Message<T>>,
    current: std::vec::IntoIter<T>,
    timeout: Duration,
    finished: bool,
}

pub fn spawn<S: PageSource>(
    stream: StreamSide,
    mut source: S,
    depth: usize,
    timeout: Duration,
) -> Result<Prefetched<S::Row>, ReconError> {
    let (tx, rx) = mpsc::sync_channel(depth.max(1));
    thread::Builder::new()
        .name(format!("prefetch-{stream}"))
        .spawn(move || produce(&mut source, &tx))
        .map_err(|err| ReconError::transient(format!("spawn {stream} prefetch"), err))?;

    Ok(Prefetched {
        stream,
        rx,
        current: Vec::new().into_iter(),
        timeout,
        finished: false,
    })
}

fn produce<S: PageSource>(source: &mut S, tx: &SyncSender<Message<S::Row>>) {
    loop {
        let msg = match source.next_page() {
            Ok(Some(page)) if page.is_empty() => continue,
            Ok(Some(page)) => Message::Page(page),
            Ok(None) => Message::End,
            Err(err) => Message::Failed(err),
        };
        let last = !matches!(msg, Message::Page(_));
        // A closed channel means the consumer stopped early; nothing to do.
        if tx.send(msg).is_err() || last {
            return;
        }
    }
}

impl<T> Iterator for Prefetched<T> {
    type Item = Result<T, ReconError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(row) = self.current.next() {
            return Some(Ok(row));
        }
        if self.finished {
            return None;
        }

        match self.rx.recv_timeout(self.timeout) {
            Ok(Message::Page(page)) => {
                self.current = page.into_iter();
                self.current.next().map(Ok)
            }
            Ok(Message::End) => {
                self.finished = true;
                None
            }
            Ok(Message::Failed(err)) => {
                self.finished = true;
                Some(Err(err))
            }
            Err(RecvTimeoutError::Timeout) => {
                self.finished = true;
                Some(Err(ReconError::PageTimeout {
                    stream: self.stream,
                    timeout_secs: self.timeout.as_secs(),
                }))
            }
            // Producer vanished without an end marker: the stream is truncated.
            Err(RecvTimeoutError::Disconnected) => {
                self.finished = true;
                Some(Err(ReconError::transient(
                    format!("{} prefetch", self.stream),
                    "producer exited before end of stream",
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counting {
        pages: Vec<Vec<u32>>,
        fail_at_end: bool,
    }

    impl PageSource for Counting {
        type Row = u32;

        fn next_page(&mut self) -> Result<Option<Vec<u32>>, ReconError> {
            if self.pages.is_empty() {
                if self.fail_at_end {
                    return Err(ReconError::transient("page", "gone"));
                }
                return Ok(None);
            }
            Ok(Some(self.pages.remove(0)))
        }
    }

    struct Stalled;

    impl PageSource for Stalled {
        type Row = u32;

        fn next_page(&mut self) -> Result<Option<Vec<u32>>, ReconError> {
            thread::sleep(Duration::from_millis(500));
            Ok(None)
        }
    }

    #[test]
    fn rows_arrive_in_page_order() {
        let source = Counting {
            pages: vec![vec![1, 2], vec![], vec![3], vec![4, 5]],
            fail_at_end: false,
        };
        let rows = spawn(StreamSide::Catalog, source, 1, Duration::from_secs(5))
            .expect("spawn")
            .collect::<Result<Vec<_>, _>>()
            .expect("rows");
        assert_eq!(rows, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn producer_error_terminates_stream() {
        let source = Counting {
            pages: vec![vec![1]],
            fail_at_end: true,
        };
        let out = spawn(StreamSide::Inventory, source, 2, Duration::from_secs(5))
            .expect("spawn")
            .collect::<Vec<_>>();
        assert_eq!(out.len(), 2);
        assert!(matches!(out[1], Err(ReconError::TransientIo { .. })));
    }

    #[test]
    fn slow_page_times_out() {
        let mut iter =
            spawn(StreamSide::Catalog, Stalled, 1, Duration::from_millis(20)).expect("spawn");
        assert!(matches!(
            iter.next(),
            Some(Err(ReconError::PageTimeout {
                stream: StreamSide::Catalog,
                ..
            }))
        ));
        assert!(iter.next().is_none());
    }
}
