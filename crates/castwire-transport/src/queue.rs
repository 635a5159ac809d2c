//! Bounded send queue between frame producers and the sender task.
//!
//! Producers never block. When the queue is full the oldest audio frame is
//! evicted first, then the oldest delta video frame, then the oldest video
//! keyframe. Reconfiguration markers are never evicted and keep their place
//! relative to frames; a marker only replaces a pending one of the same kind
//! when no frame sits between them.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use castwire_codec::{MediaFrame, MediaKind, StreamInfo};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::config::MIN_QUEUE_CAPACITY;

/// Something waiting to be written.
#[derive(Debug, Clone)]
pub(crate) enum QueueItem {
    Frame(MediaFrame),
    /// New stream description; `kind` says which half changed.
    Reconfigure {
        kind: MediaKind,
        info: Arc<StreamInfo>,
    },
}

impl QueueItem {
    fn is_marker_of(&self, marker_kind: MediaKind) -> bool {
        matches!(self, Self::Reconfigure { kind, .. } if *kind == marker_kind)
    }
}

#[derive(Debug)]
pub(crate) struct QueueEntry {
    pub item: QueueItem,
    pub admitted: Instant,
}

/// A frame removed to make room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Evicted {
    pub kind: MediaKind,
    pub keyframe: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum PushOutcome {
    Queued,
    /// Queued after evicting an older frame.
    Evicted(Evicted),
    /// The queue held only markers, so the incoming frame was dropped.
    Rejected,
    /// A pending marker of the same kind, with no frame after it, was updated in place.
    Superseded,
    /// The queue is closed.
    Closed,
}

struct Inner {
    entries: VecDeque<QueueEntry>,
    closed: bool,
}

pub(crate) struct SendQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    capacity: usize,
}

impl SendQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(MIN_QUEUE_CAPACITY);
        Self {
            inner: Mutex::new(Inner {
                entries: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn push(&self, item: QueueItem) -> PushOutcome {
        let outcome = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return PushOutcome::Closed;
            }

            if let QueueItem::Reconfigure { kind, info } = &item {
                let pending = inner
                    .entries
                    .iter_mut()
                    .rev()
                    .take_while(|entry| matches!(entry.item, QueueItem::Reconfigure { .. }))
                    .find(|entry| entry.item.is_marker_of(*kind));
                if let Some(entry) = pending {
                    entry.item = QueueItem::Reconfigure {
                        kind: *kind,
                        info: Arc::clone(info),
                    };
                    return PushOutcome::Superseded;
                }
            }

            let mut outcome = PushOutcome::Queued;
            if inner.entries.len() >= self.capacity {
                match evict_one(&mut inner.entries) {
                    Some(evicted) => {
                        drop_redundant_markers(&mut inner.entries);
                        outcome = PushOutcome::Evicted(evicted);
                    }
                    // Only markers left; the incoming frame is the one to drop.
                    None => {
                        if let QueueItem::Frame(_) = &item {
                            return PushOutcome::Rejected;
                        }
                    }
                }
            }

            inner.entries.push_back(QueueEntry {
                item,
                admitted: Instant::now(),
            });
            outcome
        };
        self.notify.notify_one();
        outcome
    }

    /// Wait for the next entry. Returns `None` once closed and empty.
    pub async fn pop(&self) -> Option<QueueEntry> {
        loop {
            {
                let mut inner = self.inner.lock();
                if let Some(entry) = inner.entries.pop_front() {
                    return Some(entry);
                }
                if inner.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    #[cfg(test)]
    pub fn try_pop(&self) -> Option<QueueEntry> {
        self.inner.lock().entries.pop_front()
    }

    /// Stop admitting entries. Queued entries can still be popped.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_one();
    }

    /// Drop everything still queued; returns the frames discarded, per kind.
    pub fn discard(&self) -> (u64, u64) {
        let mut inner = self.inner.lock();
        let mut video = 0;
        let mut audio = 0;
        for entry in inner.entries.drain(..) {
            if let QueueItem::Frame(frame) = entry.item {
                match frame.kind {
                    MediaKind::Video => video += 1,
                    MediaKind::Audio => audio += 1,
                }
            }
        }
        (video, audio)
    }
}

fn evict_one(entries: &mut VecDeque<QueueEntry>) -> Option<Evicted> {
    let position = |pred: &dyn Fn(&MediaFrame) -> bool| {
        entries
            .iter()
            .position(|entry| matches!(&entry.item, QueueItem::Frame(frame) if pred(frame)))
    };

    let index = position(&|f| f.kind == MediaKind::Audio)
        .or_else(|| position(&|f| f.kind == MediaKind::Video && !f.is_keyframe))
        .or_else(|| position(&|f| f.kind == MediaKind::Video))?;

    match entries.remove(index)?.item {
        QueueItem::Frame(frame) => Some(Evicted {
            kind: frame.kind,
            keyframe: frame.is_keyframe,
        }),
        QueueItem::Reconfigure { .. } => None,
    }
}

/// Remove markers followed by a newer one of the same kind with no frame between.
fn drop_redundant_markers(entries: &mut VecDeque<QueueEntry>) {
    let mut seen_video = false;
    let mut seen_audio = false;
    for index in (0..entries.len()).rev() {
        let kind = match &entries[index].item {
            QueueItem::Frame(_) => {
                seen_video = false;
                seen_audio = false;
                continue;
            }
            QueueItem::Reconfigure { kind, .. } => *kind,
        };
        let seen = match kind {
            MediaKind::Video => &mut seen_video,
            MediaKind::Audio => &mut seen_audio,
        };
        if *seen {
            entries.remove(index);
        } else {
            *seen = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use quickcheck::{Arbitrary, Gen};
    use quickcheck_macros::quickcheck;

    fn video(id: u64, key: bool) -> QueueItem {
        QueueItem::Frame(MediaFrame::video(Bytes::new(), id, key))
    }

    fn audio(id: u64) -> QueueItem {
        QueueItem::Frame(MediaFrame::audio(Bytes::new(), id))
    }

    fn marker(kind: MediaKind) -> QueueItem {
        QueueItem::Reconfigure {
            kind,
            info: Arc::new(StreamInfo::default()),
        }
    }

    fn drain_ids(queue: &SendQueue) -> Vec<Option<u64>> {
        std::iter::from_fn(|| queue.try_pop())
            .map(|entry| match entry.item {
                QueueItem::Frame(frame) => Some(frame.timestamp_us),
                QueueItem::Reconfigure { .. } => None,
            })
            .collect()
    }

    #[test]
    fn test_eviction_order() {
        let queue = SendQueue::new(4);
        queue.push(video(1, true));
        queue.push(video(2, false));
        queue.push(audio(3));
        queue.push(video(4, false));

        assert_eq!(
            queue.push(video(5, false)),
            PushOutcome::Evicted(Evicted {
                kind: MediaKind::Audio,
                keyframe: false
            })
        );
        assert_eq!(
            queue.push(video(6, false)),
            PushOutcome::Evicted(Evicted {
                kind: MediaKind::Video,
                keyframe: false
            })
        );
        assert_eq!(drain_ids(&queue), vec![Some(1), Some(4), Some(5), Some(6)]);
    }

    #[test]
    fn test_keyframes_evicted_last() {
        let queue = SendQueue::new(4);
        for id in 1..=4 {
            queue.push(video(id, true));
        }
        assert_eq!(
            queue.push(audio(5)),
            PushOutcome::Evicted(Evicted {
                kind: MediaKind::Video,
                keyframe: true
            })
        );
        assert_eq!(drain_ids(&queue), vec![Some(2), Some(3), Some(4), Some(5)]);
    }

    fn marker_with(kind: MediaKind, info: &Arc<StreamInfo>) -> QueueItem {
        QueueItem::Reconfigure {
            kind,
            info: Arc::clone(info),
        }
    }

    fn pop_marker(queue: &SendQueue) -> Arc<StreamInfo> {
        match queue.try_pop().map(|entry| entry.item) {
            Some(QueueItem::Reconfigure { info, .. }) => info,
            other => panic!("expected a marker, got {:?}", other),
        }
    }

    fn pop_frame(queue: &SendQueue) -> u64 {
        match queue.try_pop().map(|entry| entry.item) {
            Some(QueueItem::Frame(frame)) => frame.timestamp_us,
            other => panic!("expected a frame, got {:?}", other),
        }
    }

    #[test]
    fn test_markers_keep_their_place_between_frames() {
        let queue = SendQueue::new(8);
        let old = Arc::new(StreamInfo::default());
        let new = Arc::new(StreamInfo::default());

        queue.push(marker_with(MediaKind::Video, &old));
        queue.push(video(1, true));
        assert_eq!(queue.push(marker_with(MediaKind::Video, &new)), PushOutcome::Queued);
        queue.push(video(2, true));

        assert!(Arc::ptr_eq(&pop_marker(&queue), &old));
        assert_eq!(pop_frame(&queue), 1);
        assert!(Arc::ptr_eq(&pop_marker(&queue), &new));
        assert_eq!(pop_frame(&queue), 2);
        assert!(queue.try_pop().is_none());
    }

    #[test]
    fn test_adjacent_markers_collapse() {
        let queue = SendQueue::new(4);
        let old = Arc::new(StreamInfo::default());
        let new = Arc::new(StreamInfo::default());

        queue.push(audio(1));
        queue.push(marker_with(MediaKind::Video, &old));
        queue.push(marker(MediaKind::Audio));
        assert_eq!(
            queue.push(marker_with(MediaKind::Video, &new)),
            PushOutcome::Superseded
        );
        assert_eq!(queue.len(), 3);

        assert_eq!(pop_frame(&queue), 1);
        assert!(Arc::ptr_eq(&pop_marker(&queue), &new));
        pop_marker(&queue);
    }

    #[test]
    fn test_markers_survive_eviction() {
        let queue = SendQueue::new(4);
        queue.push(marker(MediaKind::Video));
        queue.push(audio(1));
        queue.push(marker(MediaKind::Video));
        queue.push(audio(2));

        // evicting audio 1 leaves two video markers side by side
        assert!(matches!(queue.push(audio(3)), PushOutcome::Evicted(_)));
        assert_eq!(drain_ids(&queue), vec![None, Some(2), Some(3)]);
    }

    #[test]
    fn test_closed_queue_rejects() {
        let queue = SendQueue::new(8);
        queue.push(audio(1));
        queue.close();
        assert_eq!(queue.push(audio(2)), PushOutcome::Closed);
        assert_eq!(queue.discard(), (0, 1));
        assert_eq!(queue.len(), 0);
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let queue = Arc::new(SendQueue::new(8));
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                let mut ids = vec![];
                while let Some(entry) = queue.pop().await {
                    if let QueueItem::Frame(frame) = entry.item {
                        ids.push(frame.timestamp_us);
                    }
                }
                ids
            })
        };
        for id in 0..5 {
            queue.push(audio(id));
            tokio::task::yield_now().await;
        }
        queue.close();
        assert_eq!(consumer.await.unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Audio,
        Key,
        Delta,
        VideoMarker,
        AudioMarker,
    }

    impl Arbitrary for Op {
        fn arbitrary(g: &mut Gen) -> Self {
            let ops = [
                Op::Audio,
                Op::Audio,
                Op::Key,
                Op::Delta,
                Op::Delta,
                Op::VideoMarker,
                Op::AudioMarker,
            ];
            g.choose(&ops).cloned().unwrap_or(Op::Audio)
        }
    }

    #[quickcheck]
    fn prop_bounded_and_fifo(ops: Vec<Op>, capacity: u8) -> bool {
        let queue = SendQueue::new(capacity as usize % 16);
        for (id, op) in ops.iter().enumerate() {
            let id = id as u64;
            queue.push(match op {
                Op::Audio => audio(id),
                Op::Key => video(id, true),
                Op::Delta => video(id, false),
                Op::VideoMarker => marker(MediaKind::Video),
                Op::AudioMarker => marker(MediaKind::Audio),
            });
            if queue.len() > queue.capacity() {
                return false;
            }
        }
        let ids: Vec<u64> = drain_ids(&queue).into_iter().flatten().collect();
        ids.windows(2).all(|pair| pair[0] < pair[1])
    }
}
