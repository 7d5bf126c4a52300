//! Framed events waiting for the reader
//!
//! The descriptors live in an arena of slabs, each slab
//! holds one allotment of slots. A slot is either in the
//! `ready` list (oldest first) or in the `empty` list.
//! The arena only ever grows, so a `SlotId` stays valid
//! until the slot is dequeued.
//!
//! There is no locking in here, the queue is part of
//! the pipeline state and shares its lock.

use std::fmt;

use crate::errors::QueueError;
use crate::framer::EventDescriptor;

/// Index of a slot in the arena
pub type SlotId = usize;

#[derive(Debug, Clone)]
struct Slot {
  desc   : EventDescriptor,
  prev   : Option<SlotId>,
  next   : Option<SlotId>,
  queued : bool,
}

impl Slot {
  fn vacant() -> Self {
    Self {
      desc   : EventDescriptor::new(0, 0, 0),
      prev   : None,
      next   : None,
      queued : false,
    }
  }
}

#[derive(Debug, Copy, Clone, Default)]
struct List {
  head : Option<SlotId>,
  tail : Option<SlotId>,
  len  : usize,
}

pub struct EventQueue {
  slabs          : Vec<Vec<Slot>>,
  allotment      : usize,
  /// Never grow beyond this many slabs
  max_allotments : Option<usize>,
  ready          : List,
  empty          : List,
}

impl EventQueue {

  /// A queue with one allotment of slots, growing
  /// without limit
  pub fn new(allotment : usize) -> Self {
    Self::with_limit(allotment, None)
  }

  pub fn with_limit(allotment : usize, max_allotments : Option<usize>) -> Self {
    let mut queue = Self {
      slabs          : Vec::new(),
      allotment      : allotment.max(1),
      max_allotments,
      ready          : List::default(),
      empty          : List::default(),
    };
    if let Err(err) = queue.grow() {
      error!("Can not allocate the initial event queue! {}", err);
    }
    queue
  }

  fn slot(&self, id : SlotId) -> &Slot {
    &self.slabs[id / self.allotment][id % self.allotment]
  }

  fn slot_mut(&mut self, id : SlotId) -> &mut Slot {
    let allotment = self.allotment;
    &mut self.slabs[id / allotment][id % allotment]
  }

  /// Add one allotment of slots to the empty list
  fn grow(&mut self) -> Result<(), QueueError> {
    if let Some(max) = self.max_allotments {
      if self.slabs.len() >= max {
        return Err(QueueError::QueueOverflow);
      }
    }
    let mut slab = Vec::<Slot>::new();
    if slab.try_reserve_exact(self.allotment).is_err() {
      return Err(QueueError::QueueOverflow);
    }
    if self.slabs.try_reserve(1).is_err() {
      return Err(QueueError::QueueOverflow);
    }
    slab.resize(self.allotment, Slot::vacant());
    let first = self.slabs.len()*self.allotment;
    self.slabs.push(slab);
    for id in first..first + self.allotment {
      self.push_back(false, id);
    }
    debug!("Event queue grown to {} slots", self.capacity());
    Ok(())
  }

  fn list_mut(&mut self, ready : bool) -> &mut List {
    if ready {
      &mut self.ready
    } else {
      &mut self.empty
    }
  }

  fn push_back(&mut self, ready : bool, id : SlotId) {
    let tail = self.list_mut(ready).tail;
    {
      let slot    = self.slot_mut(id);
      slot.prev   = tail;
      slot.next   = None;
      slot.queued = ready;
    }
    match tail {
      Some(t) => self.slot_mut(t).next = Some(id),
      None    => self.list_mut(ready).head = Some(id),
    }
    let list  = self.list_mut(ready);
    list.tail = Some(id);
    list.len += 1;
  }

  fn unlink(&mut self, ready : bool, id : SlotId) {
    let (prev, next) = {
      let slot = self.slot(id);
      (slot.prev, slot.next)
    };
    match prev {
      Some(p) => self.slot_mut(p).next = next,
      None    => self.list_mut(ready).head = next,
    }
    match next {
      Some(n) => self.slot_mut(n).prev = prev,
      None    => self.list_mut(ready).tail = prev,
    }
    let slot    = self.slot_mut(id);
    slot.prev   = None;
    slot.next   = None;
    slot.queued = false;
    self.list_mut(ready).len -= 1;
  }

  /// Append a descriptor to the ready list
  ///
  /// Fails only if the queue had to grow and
  /// could not.
  pub fn enqueue(&mut self, desc : EventDescriptor) -> Result<SlotId, QueueError> {
    if self.empty.head.is_none() {
      self.grow()?;
    }
    let id = match self.empty.head {
      Some(id) => id,
      None     => return Err(QueueError::QueueOverflow),
    };
    self.unlink(false, id);
    self.slot_mut(id).desc = desc;
    self.push_back(true, id);
    if self.empty.head.is_none() {
      if let Err(err) = self.grow() {
        warn!("Event queue is out of slots and can not grow! {}", err);
      }
    }
    Ok(id)
  }

  /// The oldest event
  pub fn peek(&self) -> Option<&EventDescriptor> {
    self.ready.head.map(|id| &self.slot(id).desc)
  }

  pub fn peek_id(&self) -> Option<SlotId> {
    self.ready.head
  }

  /// A queued descriptor
  pub fn get(&self, id : SlotId) -> Option<&EventDescriptor> {
    if id >= self.capacity() || !self.slot(id).queued {
      return None;
    }
    Some(&self.slot(id).desc)
  }

  /// A queued descriptor, e.g. to shrink it
  /// after a partial read
  pub fn get_mut(&mut self, id : SlotId) -> Option<&mut EventDescriptor> {
    if id >= self.capacity() || !self.slot(id).queued {
      return None;
    }
    Some(&mut self.slot_mut(id).desc)
  }

  /// Give the slot back to the empty list
  pub fn dequeue(&mut self, id : SlotId) -> Result<EventDescriptor, QueueError> {
    if id >= self.capacity() || !self.slot(id).queued {
      return Err(QueueError::NotQueued);
    }
    self.unlink(true, id);
    self.push_back(false, id);
    Ok(self.slot(id).desc)
  }

  /// Drop all queued events
  pub fn clear(&mut self) {
    while let Some(id) = self.ready.head {
      self.unlink(true, id);
      self.push_back(false, id);
    }
  }

  /// Number of queued events
  pub fn count(&self) -> usize {
    self.ready.len
  }

  pub fn empty_count(&self) -> usize {
    self.empty.len
  }

  pub fn is_empty(&self) -> bool {
    self.ready.len == 0
  }

  /// Total number of slots
  pub fn capacity(&self) -> usize {
    self.slabs.len()*self.allotment
  }

  /// The queued events, oldest first
  pub fn iter(&self) -> Iter<'_> {
    Iter {
      queue : self,
      next  : self.ready.head,
    }
  }
}

pub struct Iter<'a> {
  queue : &'a EventQueue,
  next  : Option<SlotId>,
}

impl<'a> Iterator for Iter<'a> {
  type Item = &'a EventDescriptor;

  fn next(&mut self) -> Option<Self::Item> {
    let id    = self.next?;
    let slot  = self.queue.slot(id);
    self.next = slot.next;
    Some(&slot.desc)
  }
}

impl fmt::Display for EventQueue {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "<EventQueue: {} ready, {} empty, {} slots>",
           self.count(), self.empty_count(), self.capacity())
  }
}

#[cfg(test)]
mod test_event_queue {
  use super::*;
  use crate::constants::DEFAULT_QUEUE_ALLOTMENT;

  fn desc(k : usize) -> EventDescriptor {
    EventDescriptor::new(k % 4, 36*k, 36)
  }

  #[test]
  fn fifo_order() {
    let mut q = EventQueue::new(16);
    for k in 0..10 {
      q.enqueue(desc(k)).unwrap();
    }
    let seen : Vec<EventDescriptor> = q.iter().copied().collect();
    assert_eq!(seen, (0..10).map(desc).collect::<Vec<_>>());
    for k in 0..10 {
      assert_eq!(q.peek(), Some(&desc(k)));
      let id = q.peek_id().unwrap();
      assert_eq!(q.dequeue(id).unwrap(), desc(k));
    }
    assert!(q.peek().is_none());
  }

  #[test]
  fn grows_past_initial_allotment() {
    let mut q = EventQueue::new(DEFAULT_QUEUE_ALLOTMENT);
    let n = DEFAULT_QUEUE_ALLOTMENT + 10;
    for k in 0..n {
      assert!(q.enqueue(desc(k)).is_ok());
    }
    assert_eq!(q.count(), n);
    assert_eq!(q.capacity(), 2*DEFAULT_QUEUE_ALLOTMENT);
    assert_eq!(q.count() + q.empty_count(), q.capacity());
    // order survives the growth
    assert_eq!(q.peek(), Some(&desc(0)));
    assert_eq!(q.iter().last(), Some(&desc(n-1)));
  }

  #[test]
  fn overflow_when_growth_is_refused() {
    let mut q = EventQueue::with_limit(4, Some(1));
    for k in 0..4 {
      assert!(q.enqueue(desc(k)).is_ok());
    }
    assert_eq!(q.enqueue(desc(4)), Err(QueueError::QueueOverflow));
    assert_eq!(q.count(), 4);
  }

  #[test]
  fn dequeue_twice() {
    let mut q = EventQueue::new(4);
    let id = q.enqueue(desc(0)).unwrap();
    assert!(q.dequeue(id).is_ok());
    assert_eq!(q.dequeue(id), Err(QueueError::NotQueued));
    assert_eq!(q.dequeue(1000), Err(QueueError::NotQueued));
  }

  #[test]
  fn dequeue_from_the_middle() {
    let mut q = EventQueue::new(8);
    let ids : Vec<SlotId> = (0..3).map(|k| q.enqueue(desc(k)).unwrap()).collect();
    q.dequeue(ids[1]).unwrap();
    let seen : Vec<EventDescriptor> = q.iter().copied().collect();
    assert_eq!(seen, vec![desc(0), desc(2)]);
  }

  #[test]
  fn shrink_in_place() {
    let mut q = EventQueue::new(4);
    let id = q.enqueue(desc(1)).unwrap();
    q.get_mut(id).unwrap().advance(10);
    assert_eq!(q.peek().unwrap().offset, 46);
    assert_eq!(q.peek().unwrap().len, 26);
  }

  #[test]
  fn clear_returns_all_slots() {
    let mut q = EventQueue::new(4);
    for k in 0..7 {
      q.enqueue(desc(k)).unwrap();
    }
    let capacity = q.capacity();
    q.clear();
    assert_eq!(q.count(), 0);
    assert_eq!(q.empty_count(), capacity);
    assert!(q.peek().is_none());
  }
}
