//! Request dispatch for a mirrored volume.
//!
//! Producers hand requests to one dedicated worker thread and get notified
//! through a completion callback, so submission never blocks on device i/o.
//! The lone consumer drains the queue strictly in submission order, which is
//! all the serialization the engine needs: verify-repair cycles and checksum
//! read-modify-writes never interleave.

use std::io;
use std::sync::mpsc::{self, Sender};
use std::thread::{self, JoinHandle};

use log::debug;
use mirror_blk::{DiskError, DiskLayout, MirrorVolume, SECTOR_SIZE};

/// Direction of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOp {
    Read,
    Write,
}

/// One sector-aligned request against the logical disk.
pub struct IoRequest {
    pub op: IoOp,
    pub sector: u64,
    /// Whole sectors; filled by reads, consumed by writes.
    pub buf: Vec<u8>,
}

/// Runs exactly once per submitted request, on the worker thread (or on the
/// submitting thread when the request never reaches the queue). Reads hand
/// back the filled buffer; writes return the one that was submitted. A
/// request the worker can no longer execute completes with an error instead
/// of disappearing.
pub type IoCompletion = Box<dyn FnOnce(mirror_blk::Result<Vec<u8>>) + Send>;

struct WorkItem {
    request: Option<IoRequest>,
    complete: Option<IoCompletion>,
}

impl WorkItem {
    fn new(request: IoRequest, complete: IoCompletion) -> Self {
        Self {
            request: Some(request),
            complete: Some(complete),
        }
    }

    fn finish(&mut self, result: mirror_blk::Result<Vec<u8>>) {
        if let Some(complete) = self.complete.take() {
            complete(result);
        }
    }
}

// An item dropped before `finish` (queue torn down, worker unwinding) still
// owes its producer a completion.
impl Drop for WorkItem {
    fn drop(&mut self) {
        self.finish(Err(DiskError::Io));
    }
}

/// Owner of the volume and its worker thread. Dropping the dispatcher stops
/// intake, lets the worker drain what is already queued and joins it.
pub struct IoDispatcher {
    queue: Option<Sender<WorkItem>>,
    worker: Option<JoinHandle<()>>,
    layout: DiskLayout,
}

impl IoDispatcher {
    /// Move `volume` onto a fresh worker thread.
    pub fn spawn(volume: MirrorVolume) -> io::Result<Self> {
        let layout = *volume.layout();
        let (queue, items) = mpsc::channel::<WorkItem>();
        let worker = thread::Builder::new()
            .name("mirror-io".into())
            .spawn(move || {
                while let Ok(mut item) = items.recv() {
                    if let Some(request) = item.request.take() {
                        let result = execute(&volume, request);
                        item.finish(result);
                    }
                }
                debug!("mirror-io worker drained and stopped");
            })?;
        Ok(Self {
            queue: Some(queue),
            worker: Some(worker),
            layout,
        })
    }

    /// Queue one request without blocking. The completion always runs; if
    /// the worker is gone it runs right here with an error.
    ///
    /// Panics if the request addresses sectors outside the data region.
    pub fn submit(&self, request: IoRequest, complete: IoCompletion) {
        assert!(
            self.layout
                .contains_range(request.sector, request.buf.len() / SECTOR_SIZE),
            "request at sector {} beyond the {}-sector data region",
            request.sector,
            self.layout.data_sectors()
        );
        let mut item = WorkItem::new(request, complete);
        match &self.queue {
            Some(queue) => {
                if let Err(mpsc::SendError(mut item)) = queue.send(item) {
                    item.finish(Err(DiskError::Io));
                }
            }
            None => item.finish(Err(DiskError::Io)),
        }
    }
}

fn execute(volume: &MirrorVolume, request: IoRequest) -> mirror_blk::Result<Vec<u8>> {
    let IoRequest { op, sector, mut buf } = request;
    match op {
        IoOp::Read => volume.read_sectors(sector, &mut buf)?,
        IoOp::Write => volume.write_sectors(sector, &buf)?,
    }
    Ok(buf)
}

impl Drop for IoDispatcher {
    fn drop(&mut self) {
        // Closing the channel lets the worker finish whatever is queued.
        self.queue.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_disk::testing::TempImage;
    use crate::file_disk::FileDisk;
    use mirror_blk::BlockDevice;
    use std::sync::{Arc, Mutex};

    const DATA_SECTORS: u64 = 64;

    fn file_volume(tag: &str) -> (MirrorVolume, TempImage, TempImage) {
        let layout = DiskLayout::new(DATA_SECTORS);
        let a = TempImage::new(&format!("{}-a", tag), layout.total_sectors());
        let b = TempImage::new(&format!("{}-b", tag), layout.total_sectors());
        let volume = MirrorVolume::format(
            [
                Arc::new(a.disk()) as Arc<dyn BlockDevice>,
                Arc::new(b.disk()),
            ],
            layout,
        )
        .unwrap();
        (volume, a, b)
    }

    fn block(byte: u8) -> Vec<u8> {
        vec![byte; SECTOR_SIZE]
    }

    #[test]
    fn completions_run_in_submission_order_exactly_once() {
        let (volume, _a, _b) = file_volume("order");
        let dispatcher = IoDispatcher::spawn(volume).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..8u8 {
            let log = log.clone();
            dispatcher.submit(
                IoRequest {
                    op: IoOp::Write,
                    sector: i as u64,
                    buf: block(i),
                },
                Box::new(move |result| {
                    result.unwrap();
                    log.lock().unwrap().push(i as usize);
                }),
            );
        }
        for i in 0..8u8 {
            let log = log.clone();
            dispatcher.submit(
                IoRequest {
                    op: IoOp::Read,
                    sector: i as u64,
                    buf: vec![0; SECTOR_SIZE],
                },
                Box::new(move |result| {
                    assert_eq!(result.unwrap(), block(i));
                    log.lock().unwrap().push(8 + i as usize);
                }),
            );
        }
        drop(dispatcher);
        assert_eq!(*log.lock().unwrap(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn a_read_queued_behind_a_write_sees_its_data() {
        let (volume, _a, _b) = file_volume("raw");
        let dispatcher = IoDispatcher::spawn(volume).unwrap();
        let (tx, rx) = mpsc::channel();
        let tx_write = tx.clone();
        dispatcher.submit(
            IoRequest {
                op: IoOp::Write,
                sector: 9,
                buf: block(0xcd),
            },
            Box::new(move |result| tx_write.send(result).unwrap()),
        );
        dispatcher.submit(
            IoRequest {
                op: IoOp::Read,
                sector: 9,
                buf: vec![0; SECTOR_SIZE],
            },
            Box::new(move |result| tx.send(result).unwrap()),
        );
        assert!(rx.recv().unwrap().is_ok());
        assert_eq!(rx.recv().unwrap().unwrap(), block(0xcd));
    }

    #[test]
    fn producers_on_many_threads_all_complete() {
        let (volume, _a, _b) = file_volume("mt");
        let dispatcher = Arc::new(IoDispatcher::spawn(volume).unwrap());
        let (tx, rx) = mpsc::channel();
        let mut producers = Vec::new();
        for t in 0..4u8 {
            let dispatcher = dispatcher.clone();
            let tx = tx.clone();
            producers.push(thread::spawn(move || {
                for i in 0..4u8 {
                    let sector = (t * 4 + i) as u64;
                    let tx = tx.clone();
                    dispatcher.submit(
                        IoRequest {
                            op: IoOp::Write,
                            sector,
                            buf: block(sector as u8),
                        },
                        Box::new(move |result| tx.send(result.map(|_| sector)).unwrap()),
                    );
                }
            }));
        }
        drop(tx);
        for producer in producers {
            producer.join().unwrap();
        }
        let mut done: Vec<u64> = rx.iter().map(|result| result.unwrap()).collect();
        done.sort_unstable();
        assert_eq!(done, (0..16).collect::<Vec<_>>());
        // Every write landed; verify through the same dispatcher.
        let (tx, rx) = mpsc::channel();
        for sector in 0..16u64 {
            let tx = tx.clone();
            dispatcher.submit(
                IoRequest {
                    op: IoOp::Read,
                    sector,
                    buf: vec![0; SECTOR_SIZE],
                },
                Box::new(move |result| {
                    assert_eq!(result.unwrap(), block(sector as u8));
                    tx.send(()).unwrap();
                }),
            );
        }
        drop(tx);
        assert_eq!(rx.iter().count(), 16);
    }

    #[test]
    fn dropping_the_dispatcher_drains_queued_writes() {
        let layout = DiskLayout::new(DATA_SECTORS);
        let (volume, a, b) = file_volume("drain");
        {
            let dispatcher = IoDispatcher::spawn(volume).unwrap();
            for i in 0..8u8 {
                dispatcher.submit(
                    IoRequest {
                        op: IoOp::Write,
                        sector: i as u64,
                        buf: block(0xe0 + i),
                    },
                    Box::new(|result| {
                        result.unwrap();
                    }),
                );
            }
        }
        // The worker was joined, so the images are settled.
        let volume = MirrorVolume::open(
            [
                Arc::new(a.disk()) as Arc<dyn BlockDevice>,
                Arc::new(b.disk()),
            ],
            layout,
        )
        .unwrap();
        let mut buf = vec![0u8; 8 * SECTOR_SIZE];
        volume.read_sectors(0, &mut buf).unwrap();
        for i in 0..8usize {
            assert_eq!(buf[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE], block(0xe0 + i as u8));
        }
    }

    #[test]
    fn misaligned_requests_complete_with_an_error() {
        let (volume, _a, _b) = file_volume("misaligned");
        let dispatcher = IoDispatcher::spawn(volume).unwrap();
        let (tx, rx) = mpsc::channel();
        dispatcher.submit(
            IoRequest {
                op: IoOp::Read,
                sector: 0,
                buf: vec![0; 100],
            },
            Box::new(move |result| tx.send(result).unwrap()),
        );
        assert_eq!(rx.recv().unwrap(), Err(DiskError::Unaligned { len: 100 }));
    }

    /// Replica whose reads panic, for killing the worker on purpose.
    struct PanicOnRead {
        inner: FileDisk,
    }

    impl BlockDevice for PanicOnRead {
        fn num_sectors(&self) -> u64 {
            self.inner.num_sectors()
        }

        fn read_at(&self, _sector: u64, _buf: &mut [u8]) -> mirror_blk::Result<()> {
            panic!("injected device failure");
        }

        fn write_at(&self, sector: u64, buf: &[u8]) -> mirror_blk::Result<()> {
            self.inner.write_at(sector, buf)
        }
    }

    #[test]
    fn requests_around_a_dying_worker_complete_with_errors() {
        let layout = DiskLayout::new(DATA_SECTORS);
        let a = TempImage::new("dying-a", layout.total_sectors());
        let b = TempImage::new("dying-b", layout.total_sectors());
        // Formatting only writes; the first read kills the worker.
        let volume = MirrorVolume::format(
            [
                Arc::new(a.disk()) as Arc<dyn BlockDevice>,
                Arc::new(PanicOnRead { inner: b.disk() }),
            ],
            layout,
        )
        .unwrap();
        let dispatcher = IoDispatcher::spawn(volume).unwrap();
        let (tx, rx) = mpsc::channel();
        let tx_first = tx.clone();
        dispatcher.submit(
            IoRequest {
                op: IoOp::Read,
                sector: 0,
                buf: vec![0; SECTOR_SIZE],
            },
            Box::new(move |result| tx_first.send(result).unwrap()),
        );
        assert_eq!(rx.recv().unwrap(), Err(DiskError::Io));
        // The worker is gone; later submissions still get a completion.
        dispatcher.submit(
            IoRequest {
                op: IoOp::Read,
                sector: 1,
                buf: vec![0; SECTOR_SIZE],
            },
            Box::new(move |result| tx.send(result).unwrap()),
        );
        assert_eq!(rx.recv().unwrap(), Err(DiskError::Io));
    }

    #[test]
    #[should_panic]
    fn out_of_range_submission_panics_on_the_caller() {
        let (volume, _a, _b) = file_volume("range");
        let dispatcher = IoDispatcher::spawn(volume).unwrap();
        dispatcher.submit(
            IoRequest {
                op: IoOp::Read,
                sector: DATA_SECTORS,
                buf: vec![0; SECTOR_SIZE],
            },
            Box::new(|_| {}),
        );
    }
}
