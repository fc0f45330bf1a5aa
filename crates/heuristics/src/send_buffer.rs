#![forbid(unsafe_code)]

//! Queue of outbound messages with recycling of spent buffers.
//!
//! A message is obtained with [`SendBufferList::get_new`], filled, and
//! either committed with [`put`](SendBufferList::put) or handed back with
//! [`discard_new`](SendBufferList::discard_new). The writer peeks the head
//! with [`get_active`](SendBufferList::get_active), advances
//! `msg_already_sent_bytes` as the pipe accepts data, and retires the head
//! with [`delete`](SendBufferList::delete) once it is fully sent. At most
//! `max_list_entries` buffers of at most `max_buffer_size` bytes each ever
//! exist.

use crate::dynar::Dynar;
use std::collections::VecDeque;

#[derive(Debug)]
pub struct SendBuffer {
    pub buffer: Dynar,
    pub msg_already_sent_bytes: usize,
}

impl SendBuffer {
    /// Bytes still waiting to be written.
    pub fn unsent(&self) -> &[u8] {
        let start = self.msg_already_sent_bytes.min(self.buffer.len());
        &self.buffer.as_bytes()[start..]
    }

    pub fn is_fully_sent(&self) -> bool {
        self.msg_already_sent_bytes >= self.buffer.len()
    }
}

#[derive(Debug)]
pub struct SendBufferList {
    pending: VecDeque<SendBuffer>,
    free: Vec<SendBuffer>,
    allocated: usize,
    max_list_entries: usize,
    max_buffer_size: usize,
}

impl SendBufferList {
    pub fn new(max_list_entries: usize, max_buffer_size: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            free: Vec::new(),
            allocated: 0,
            max_list_entries,
            max_buffer_size,
        }
    }

    /// Take an empty buffer, recycling a spent one when possible.
    ///
    /// Returns `None` once `max_list_entries` buffers are outstanding.
    pub fn get_new(&mut self) -> Option<SendBuffer> {
        if let Some(mut entry) = self.free.pop() {
            entry.buffer.clean();
            entry.buffer.set_max_size(self.max_buffer_size);
            entry.msg_already_sent_bytes = 0;
            return Some(entry);
        }

        if self.allocated >= self.max_list_entries {
            return None;
        }
        self.allocated += 1;

        Some(SendBuffer {
            buffer: Dynar::new(self.max_buffer_size),
            msg_already_sent_bytes: 0,
        })
    }

    /// Queue a filled buffer behind everything already pending.
    pub fn put(&mut self, entry: SendBuffer) {
        self.pending.push_back(entry);
    }

    /// Return a buffer obtained from [`get_new`](Self::get_new) unused.
    pub fn discard_new(&mut self, entry: SendBuffer) {
        self.free.push(entry);
    }

    /// The message currently being sent.
    pub fn get_active(&mut self) -> Option<&mut SendBuffer> {
        self.pending.front_mut()
    }

    /// Retire the active message, keeping its allocation for reuse.
    pub fn delete(&mut self) {
        if let Some(entry) = self.pending.pop_front() {
            self.free.push(entry);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn set_max_buffer_size(&mut self, max_buffer_size: usize) {
        self.max_buffer_size = max_buffer_size;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(list: &mut SendBufferList, msg: &str) -> SendBuffer {
        let mut entry = list.get_new().expect("room for a new buffer");
        entry.buffer.str_cpy(msg).unwrap();
        entry
    }

    #[test]
    fn fifo_order_and_partial_sends() {
        let mut list = SendBufferList::new(4, 64);
        let first = filled(&mut list, "first\n");
        let second = filled(&mut list, "second\n");
        list.put(first);
        list.put(second);

        let active = list.get_active().unwrap();
        assert_eq!(active.unsent(), b"first\n");
        active.msg_already_sent_bytes += 3;
        assert_eq!(list.get_active().unwrap().unsent(), b"st\n");
        assert!(!list.get_active().unwrap().is_fully_sent());

        list.get_active().unwrap().msg_already_sent_bytes = 6;
        assert!(list.get_active().unwrap().is_fully_sent());
        list.delete();

        assert_eq!(list.get_active().unwrap().unsent(), b"second\n");
        list.delete();
        assert!(list.is_empty());
    }

    #[test]
    fn allocation_is_capped_and_recycled() {
        let mut list = SendBufferList::new(2, 8);
        let a = filled(&mut list, "a");
        let b = filled(&mut list, "b");
        assert!(list.get_new().is_none());

        list.discard_new(a);
        let reused = list.get_new().expect("discarded buffer is reused");
        assert!(reused.buffer.is_empty());
        assert_eq!(reused.msg_already_sent_bytes, 0);

        list.put(b);
        list.put(reused);
        list.delete();
        assert_eq!(list.pending_len(), 1);
        assert!(list.get_new().is_some());
        assert!(list.get_new().is_none());
    }

    #[test]
    fn recycled_buffers_pick_up_new_size_limit() {
        let mut list = SendBufferList::new(1, 4);
        let entry = list.get_new().unwrap();
        list.discard_new(entry);

        list.set_max_buffer_size(16);
        let mut entry = list.get_new().unwrap();
        entry.buffer.str_cpy("longer than four").unwrap();
    }
}
