// SPDX-License-Identifier: MIT OR Apache-2.0

//! Ordered doubly-linked list with middle-pointer acceleration.
//!
//! Nodes live in an arena and link to each other by index, so the
//! structure owns its cells and no raw pointers escape. Every list
//! tracks a `middle` node, its ordinal `middle_position`, and a
//! `balance` counter: each mutation nudges the balance by one towards
//! the side it happened on, and when it reaches ±2 the middle steps a
//! node in that direction and the balance resets. Position lookups
//! start from the nearest of head, middle, or tail, which bounds the
//! walk at N/4 nodes.

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cmp::Ordering;

type Comparator<T> = fn(&T, &T) -> Ordering;

/// Receives data-to-node associations for indexed lists. Deletions of
/// indexed items route back through the indexer.
pub trait Indexer<T> {
    fn index(&mut self, data: &T, node: u32);
    fn unindex(&mut self, data: &T);
    fn find(&self, data: &T) -> Option<u32>;
}

#[derive(Clone, Copy, Debug)]
pub enum InsertAt {
    Head,
    Tail,
    Sorted,
    Indexed,
    Position(usize),
}

#[derive(Clone, Copy, Debug)]
pub enum DeleteAt<'a, T> {
    Head,
    Tail,
    FindBy(&'a T),
    Position(usize),
}

#[derive(Debug)]
struct Node<T> {
    data: Option<T>,
    next: Option<u32>,
    prev: Option<u32>,
}

pub struct List<T> {
    nodes: Vec<Node<T>>,
    free: Vec<u32>,
    head: Option<u32>,
    tail: Option<u32>,
    middle: Option<u32>,
    middle_position: usize,
    balance: i8,
    len: usize,
    sorted: bool,
    comparator: Comparator<T>,
    equality_comparator: Option<Comparator<T>>,
    indexer: Option<Box<dyn Indexer<T> + Send>>,
}

impl<T> core::fmt::Debug for List<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("List")
            .field("len", &self.len)
            .field("middle_position", &self.middle_position)
            .field("balance", &self.balance)
            .finish()
    }
}

fn default_comparator<T: Ord>(a: &T, b: &T) -> Ordering {
    a.cmp(b)
}

impl<T: Ord> List<T> {
    /// Sorted list using the default integer-style comparison.
    pub fn sorted() -> Self {
        Self::sorted_by(default_comparator::<T>)
    }

    /// Plain list with the default comparison available for find-by
    /// deletions.
    pub fn new() -> Self {
        Self::with_comparator(default_comparator::<T>)
    }
}

impl<T: Ord> Default for List<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> List<T> {
    pub fn with_comparator(comparator: Comparator<T>) -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            middle: None,
            middle_position: 0,
            balance: 0,
            len: 0,
            sorted: false,
            comparator,
            equality_comparator: None,
            indexer: None,
        }
    }

    pub fn sorted_by(comparator: Comparator<T>) -> Self {
        let mut list = Self::with_comparator(comparator);
        list.sorted = true;
        list
    }

    pub fn indexed(comparator: Comparator<T>, indexer: Box<dyn Indexer<T> + Send>) -> Self {
        let mut list = Self::with_comparator(comparator);
        list.indexer = Some(indexer);
        list
    }

    /// Comparator used by find-by deletions and `contains` when the
    /// ordering comparator keys on something other than identity.
    pub fn set_equality_comparator(&mut self, comparator: Comparator<T>) {
        self.equality_comparator = Some(comparator);
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn data(&self, node: u32) -> &T {
        self.nodes[node as usize]
            .data
            .as_ref()
            .expect("list node without data")
    }

    fn next_of(&self, node: u32) -> Option<u32> {
        self.nodes[node as usize].next
    }

    fn prev_of(&self, node: u32) -> Option<u32> {
        self.nodes[node as usize].prev
    }

    fn alloc_node(&mut self, data: T) -> u32 {
        if let Some(idx) = self.free.pop() {
            self.nodes[idx as usize] = Node {
                data: Some(data),
                next: None,
                prev: None,
            };
            idx
        } else {
            self.nodes.push(Node {
                data: Some(data),
                next: None,
                prev: None,
            });
            (self.nodes.len() - 1) as u32
        }
    }

    fn release_node(&mut self, node: u32) -> T {
        let data = self.nodes[node as usize]
            .data
            .take()
            .expect("list node without data");
        self.nodes[node as usize].next = None;
        self.nodes[node as usize].prev = None;
        self.free.push(node);
        data
    }

    fn compare(&self, a: &T, b: &T) -> i8 {
        match (self.comparator)(a, b) {
            Ordering::Less => -1,
            Ordering::Equal => 0,
            Ordering::Greater => 1,
        }
    }

    fn equals(&self, a: &T, b: &T) -> bool {
        let cmp = self.equality_comparator.unwrap_or(self.comparator);
        cmp(a, b) == Ordering::Equal
    }

    fn renormalize(&mut self) {
        if self.balance == -2 {
            if let Some(p) = self.middle.and_then(|m| self.prev_of(m)) {
                self.middle = Some(p);
                self.middle_position -= 1;
            }
            self.balance = 0;
        } else if self.balance == 2 {
            if let Some(n) = self.middle.and_then(|m| self.next_of(m)) {
                self.middle = Some(n);
                self.middle_position += 1;
            }
            self.balance = 0;
        }
    }

    /// Inserts `data` at the requested place and returns the position
    /// it landed at.
    pub fn insert_at(&mut self, place: InsertAt, data: T) -> usize {
        if self.head.is_none() {
            let item = self.alloc_node(data);
            if let (InsertAt::Indexed, Some(indexer)) = (place, self.indexer.as_mut()) {
                let node_data = self.nodes[item as usize].data.as_ref().unwrap();
                indexer.index(node_data, item);
            }
            self.head = Some(item);
            self.tail = Some(item);
            self.middle = Some(item);
            self.middle_position = 0;
            self.balance = 0;
            self.len = 1;
            return 0;
        }

        let result = match place {
            InsertAt::Head => {
                let item = self.alloc_node(data);
                self.link_before(item, self.head.unwrap());
                self.balance -= 1;
                self.middle_position += 1;
                self.renormalize();
                0
            }
            InsertAt::Tail => {
                let item = self.alloc_node(data);
                self.link_after(item, self.tail.unwrap());
                self.balance += 1;
                self.renormalize();
                self.len
            }
            InsertAt::Sorted => self.insert_sorted_inner(data),
            InsertAt::Indexed => {
                let item = self.alloc_node(data);
                self.link_before(item, self.head.unwrap());
                if let Some(indexer) = self.indexer.as_mut() {
                    let node_data = self.nodes[item as usize].data.as_ref().unwrap();
                    indexer.index(node_data, item);
                }
                0
            }
            InsertAt::Position(position) => {
                let item = self.alloc_node(data);
                let mut cur = self.head;
                let mut index = 0;
                while index < position {
                    match cur {
                        Some(c) => cur = self.next_of(c),
                        None => break,
                    }
                    index += 1;
                }
                let result = match cur {
                    Some(c) if self.nodes[c as usize].data.is_some() => {
                        self.link_before(item, c);
                        index
                    }
                    _ => {
                        self.link_after(item, self.tail.unwrap());
                        self.len
                    }
                };
                if result > self.middle_position {
                    self.balance += 1;
                } else {
                    self.middle_position += 1;
                    self.balance -= 1;
                }
                self.renormalize();
                result
            }
        };

        self.len += 1;
        result
    }

    fn link_before(&mut self, item: u32, before: u32) {
        let prev = self.prev_of(before);
        self.nodes[item as usize].next = Some(before);
        self.nodes[item as usize].prev = prev;
        self.nodes[before as usize].prev = Some(item);
        match prev {
            Some(p) => self.nodes[p as usize].next = Some(item),
            None => self.head = Some(item),
        }
    }

    fn link_after(&mut self, item: u32, after: u32) {
        let next = self.next_of(after);
        self.nodes[item as usize].prev = Some(after);
        self.nodes[item as usize].next = next;
        self.nodes[after as usize].next = Some(item);
        match next {
            Some(n) => self.nodes[n as usize].prev = Some(item),
            None => self.tail = Some(item),
        }
    }

    fn insert_sorted_inner(&mut self, data: T) -> usize {
        let middle = self.middle.expect("non-empty list without middle");
        let mut result = 0;
        let before_middle;
        let c_res;
        let mut cur;

        if self.compare(&data, self.data(middle)) <= 0 {
            let mut h = self.head.unwrap();
            let mut t = middle;
            c_res = self.narrow(self.middle_position + 1, &data, &mut h, &mut t, &mut result);
            cur = h;
            before_middle = true;
        } else {
            result = self.middle_position;
            let mut h = middle;
            let mut t = self.tail.unwrap();
            c_res = self.narrow(
                self.len - self.middle_position,
                &data,
                &mut h,
                &mut t,
                &mut result,
            );
            cur = h;
            before_middle = false;
        }

        let mut insert_at_end = false;
        if c_res == 1 && self.next_of(cur).is_none() {
            insert_at_end = true;
            cur = self.tail.unwrap();
        }

        let item = self.alloc_node(data);
        if insert_at_end {
            self.link_after(item, cur);
            result = self.len;
        } else {
            self.link_before(item, cur);
        }

        if before_middle {
            self.middle_position += 1;
            self.balance -= 1;
        } else {
            self.balance += 1;
        }
        self.renormalize();

        result
    }

    /// Bisection-by-quarters between two anchors. Narrows `[head,
    /// tail]` spanning `s` nodes until three or fewer remain, then
    /// walks to the first node not less than `data`. Returns the final
    /// comparison result against `*head`; `position` accumulates the
    /// ordinal of `*head` relative to its starting value.
    fn narrow(
        &self,
        mut s: usize,
        data: &T,
        head: &mut u32,
        tail: &mut u32,
        position: &mut usize,
    ) -> i8 {
        let mut h = *head;
        let mut t = *tail;

        if h == t {
            return self.compare(data, self.data(h));
        }

        let mut c_res = -1;
        let mut t_pos = *position;
        let mut found_equal = false;

        while h != t && s > 0 {
            let c_res_h = self.compare(data, self.data(h));

            if c_res_h == 0 {
                found_equal = true;
                break;
            }

            let c_res_t = self.compare(data, self.data(t));

            if c_res_t == 0 {
                t_pos += s - 1;
                found_equal = true;
                h = t;
                *head = h;
                break;
            }

            if s == 2 {
                break;
            }

            if s == 3 {
                if c_res_h == 1 {
                    h = self.next_of(h).unwrap();
                    t_pos += 1;
                    *head = h;
                }
                break;
            }

            let q_s = s >> 2;
            for _ in 0..q_s {
                h = self.next_of(h).unwrap();
                t = self.prev_of(t).unwrap();
            }

            if self.compare(data, self.data(h)) <= 0 {
                t = h;
                h = *head;
                s = q_s + 1;
            } else if self.compare(data, self.data(t)) >= 0 {
                h = t;
                t = *tail;
                t_pos += s - (q_s + 1);
                s = q_s + 1;
            } else {
                s -= 2 * q_s;
                t_pos += q_s;
            }

            *head = h;
            *tail = t;
        }

        *head = h;

        if found_equal {
            // Rewind over a run of equal keys so the reported position
            // is the first of the run.
            while let Some(p) = self.prev_of(h) {
                if self.compare(data, self.data(p)) == 0 {
                    h = p;
                    *head = h;
                    t_pos -= 1;
                } else {
                    *position = t_pos;
                    return 0;
                }
            }
            *position = t_pos;
            return 0;
        }

        c_res = self.compare(data, self.data(h));

        if c_res == -1 {
            *position = t_pos;
            return -1;
        }

        if c_res == 0 {
            while let Some(p) = self.prev_of(h) {
                if self.compare(data, self.data(p)) == 0 {
                    h = p;
                    *head = h;
                    t_pos -= 1;
                } else {
                    break;
                }
            }
            *position = t_pos;
            return 0;
        }

        while c_res == 1 {
            match self.next_of(h) {
                None => return 1,
                Some(n) => {
                    h = n;
                    *head = h;
                    t_pos += 1;
                    c_res = self.compare(data, self.data(h));
                }
            }
        }

        *position = t_pos;
        c_res
    }

    /// Removes and returns the item at the requested place, or `None`
    /// if nothing matches.
    pub fn delete_at(&mut self, place: DeleteAt<'_, T>) -> Option<T> {
        if self.len == 0 {
            return None;
        }

        match place {
            DeleteAt::Head => self.delete_head(),
            DeleteAt::Tail => self.delete_tail(),
            DeleteAt::Position(position) => self.delete_position(position),
            DeleteAt::FindBy(data) => self.delete_find_by(data),
        }
    }

    fn delete_head(&mut self) -> Option<T> {
        let item = self.head?;
        let next = self.next_of(item);
        self.head = next;

        match next {
            None => {
                self.tail = None;
                self.middle = None;
            }
            Some(n) => {
                self.nodes[n as usize].prev = None;
                if self.middle == Some(item) {
                    self.middle = self.next_of(item);
                    self.balance -= 1;
                }
            }
        }

        let data = self.release_node(item);
        self.len -= 1;

        self.balance += 1;
        if self.middle_position > 0 {
            self.middle_position -= 1;
        }

        if self.middle.is_some() {
            self.renormalize();
        } else {
            self.balance = 0;
            self.middle_position = 0;
        }

        Some(data)
    }

    fn delete_tail(&mut self) -> Option<T> {
        let item = self.tail?;
        let prev = self.prev_of(item);
        self.tail = prev;

        match prev {
            None => {
                self.head = None;
                self.middle = None;
            }
            Some(p) => {
                self.nodes[p as usize].next = None;
                if self.middle == Some(item) {
                    self.middle = Some(p);
                    self.middle_position -= 1;
                    self.balance += 1;
                }
            }
        }

        let data = self.release_node(item);
        self.len -= 1;

        self.balance -= 1;

        if self.middle.is_some() {
            self.renormalize();
        } else {
            self.balance = 0;
            self.middle_position = 0;
        }

        Some(data)
    }

    fn delete_position(&mut self, position: usize) -> Option<T> {
        if position >= self.len {
            return None;
        }
        if self.len == 1 {
            return self.delete_head();
        }

        let mut cur;
        let mut index;
        if position >= self.middle_position {
            cur = self.middle;
            index = self.middle_position;
        } else {
            cur = self.head;
            index = 0;
        }

        while index < position {
            cur = self.next_of(cur?);
            index += 1;
        }

        let item = cur?;
        self.unlink_and_settle_middle(item, index);
        let data = self.release_node(item);
        self.len -= 1;
        Some(data)
    }

    fn delete_find_by(&mut self, data: &T) -> Option<T> {
        if let Some(indexer) = self.indexer.as_mut() {
            let item = indexer.find(data)?;
            let node_data = self.nodes[item as usize].data.as_ref().unwrap();
            indexer.unindex(node_data);
            let index = self.position_of_node(item);
            self.unlink_and_settle_middle(item, index);
            let data = self.release_node(item);
            self.len -= 1;
            return Some(data);
        }

        let mut cursor = self.cursor();
        loop {
            let matches = match cursor.get() {
                Some(item) => cursor.list.equals(item, data),
                None => return None,
            };
            if matches {
                return cursor.remove();
            }
            cursor.move_next();
        }
    }

    fn position_of_node(&self, node: u32) -> usize {
        let mut index = 0;
        let mut cur = self.head;
        while let Some(c) = cur {
            if c == node {
                break;
            }
            cur = self.next_of(c);
            index += 1;
        }
        index
    }

    fn unlink_and_settle_middle(&mut self, item: u32, index: usize) {
        let previous = self.prev_of(item);
        let next = self.next_of(item);

        match previous {
            None => {
                self.head = next;
                if let Some(n) = next {
                    self.nodes[n as usize].prev = None;
                }
            }
            Some(p) => self.nodes[p as usize].next = next,
        }

        match next {
            None => {
                self.tail = previous;
                if let Some(p) = previous {
                    self.nodes[p as usize].next = None;
                }
            }
            Some(n) => self.nodes[n as usize].prev = previous,
        }

        match index.cmp(&self.middle_position) {
            Ordering::Equal => match previous {
                Some(p) => {
                    self.middle = Some(p);
                    self.middle_position -= 1;
                    self.balance += 1;
                }
                None => {
                    self.middle = next;
                    self.balance -= 1;
                }
            },
            Ordering::Less => {
                self.balance += 1;
                self.middle_position -= 1;
            }
            Ordering::Greater => {
                self.balance -= 1;
            }
        }

        if self.middle.is_some() {
            self.renormalize();
        } else {
            self.balance = 0;
            self.middle_position = 0;
        }
    }

    /// Position lookup picking the nearest of head, middle, or tail,
    /// walking at most N/4 nodes.
    pub fn get(&self, position: usize) -> Option<&T> {
        if position >= self.len {
            return None;
        }

        let mut rem = position;
        let mut item = self.head?;
        let mut to_left = false;

        if let Some(middle) = self.middle {
            if rem >= self.middle_position {
                item = middle;
                rem -= self.middle_position;

                let rev_position = self.len - self.middle_position - rem - 1;
                if rem > rev_position {
                    item = self.tail?;
                    rem = rev_position;
                    to_left = true;
                }
            } else {
                let rev_position = self.middle_position - rem;
                if rem > rev_position {
                    item = middle;
                    rem = rev_position;
                    to_left = true;
                }
            }
        }

        while rem > 0 {
            item = if to_left {
                self.prev_of(item)?
            } else {
                self.next_of(item)?
            };
            rem -= 1;
        }

        Some(self.data(item))
    }

    /// Finds the ordinal of `data`. Sorted lists without an equality
    /// comparator use the narrowing search; everything else scans.
    pub fn position_of(&self, data: &T) -> Option<usize> {
        if self.len == 0 {
            return None;
        }

        if self.sorted && self.equality_comparator.is_none() {
            if let Some(middle) = self.middle {
                let mut position = 0;
                let c_res = if self.compare(data, self.data(middle)) < 0 {
                    let mut h = self.head?;
                    let mut m = middle;
                    self.narrow(self.middle_position + 1, data, &mut h, &mut m, &mut position)
                } else {
                    position = self.middle_position;
                    let mut m = middle;
                    let mut t = self.tail?;
                    self.narrow(
                        self.len - self.middle_position,
                        data,
                        &mut m,
                        &mut t,
                        &mut position,
                    )
                };
                return (c_res == 0).then_some(position);
            }
        }

        let mut position = 0;
        let mut cur = self.head;
        while let Some(c) = cur {
            if self.equals(self.data(c), data) {
                return Some(position);
            }
            position += 1;
            cur = self.next_of(c);
        }
        None
    }

    pub fn contains(&self, data: &T) -> bool {
        self.position_of(data).is_some()
    }

    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            list: self,
            current: self.head,
        }
    }

    pub fn cursor(&mut self) -> Cursor<'_, T> {
        Cursor {
            current: self.head,
            current_position: 0,
            current_deleted: false,
            list: self,
        }
    }

    // Queue conveniences; the interrupt queue and the manager request
    // queue push at the tail and pop at the head.

    pub fn queue_push(&mut self, data: T) {
        self.insert_at(InsertAt::Tail, data);
    }

    pub fn queue_pop(&mut self) -> Option<T> {
        self.delete_at(DeleteAt::Head)
    }

    pub fn queue_peek(&self) -> Option<&T> {
        self.head.map(|h| self.data(h))
    }

    #[cfg(test)]
    fn check_middle_invariant(&self) {
        assert!(self.balance.abs() <= 1, "balance out of range");
        if let Some(middle) = self.middle {
            let mut index = 0;
            let mut cur = self.head;
            while let Some(c) = cur {
                if c == middle {
                    break;
                }
                cur = self.next_of(c);
                index += 1;
            }
            assert_eq!(index, self.middle_position, "middle position drifted");
        } else {
            assert_eq!(self.len, 0);
        }
    }
}

#[derive(Debug)]
pub struct Iter<'a, T> {
    list: &'a List<T>,
    current: Option<u32>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        let current = self.current?;
        self.current = self.list.next_of(current);
        Some(self.list.data(current))
    }
}

/// Cursor over a list. `remove` takes the current element out,
/// maintains the middle bookkeeping, and leaves the cursor on the
/// following element.
#[derive(Debug)]
pub struct Cursor<'a, T> {
    list: &'a mut List<T>,
    current: Option<u32>,
    current_position: usize,
    current_deleted: bool,
}

impl<T> Cursor<'_, T> {
    pub fn get(&self) -> Option<&T> {
        self.current.map(|c| self.list.data(c))
    }

    pub fn move_next(&mut self) {
        if self.current.is_some() {
            if self.current_deleted {
                self.current_deleted = false;
            } else {
                self.current = self.list.next_of(self.current.unwrap());
                self.current_position += 1;
            }
        }
    }

    pub fn at_end(&self) -> bool {
        self.current.is_none()
    }

    pub fn remove(&mut self) -> Option<T> {
        let item = self.current?;
        let next = self.list.next_of(item);

        if let Some(indexer) = self.list.indexer.as_mut() {
            let node_data = self.list.nodes[item as usize].data.as_ref().unwrap();
            indexer.unindex(node_data);
        }

        self.list
            .unlink_and_settle_middle(item, self.current_position);
        let data = self.list.release_node(item);
        self.list.len -= 1;

        self.current = next;
        self.current_deleted = true;

        Some(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::collections::BTreeMap;
    use alloc::vec;

    #[test]
    fn test_insert_into_empty_sets_all_anchors() {
        let mut list: List<u64> = List::new();
        let pos = list.insert_at(InsertAt::Tail, 42);
        assert_eq!(pos, 0);
        assert_eq!(list.head, list.tail);
        assert_eq!(list.head, list.middle);
        assert_eq!(list.get(0), Some(&42));
    }

    #[test]
    fn test_sorted_insert_rebalances_middle() {
        let mut list: List<u64> = List::sorted();
        for value in [5u64, 3, 7, 1, 9, 4, 6] {
            list.insert_at(InsertAt::Sorted, value);
            list.check_middle_invariant();
        }
        assert_eq!(list.get(3), Some(&5));
        let collected: Vec<u64> = list.iter().copied().collect();
        assert_eq!(collected, vec![1, 3, 4, 5, 6, 7, 9]);
    }

    #[test]
    fn test_sorted_insert_returns_position() {
        let mut list: List<u64> = List::sorted();
        assert_eq!(list.insert_at(InsertAt::Sorted, 10), 0);
        assert_eq!(list.insert_at(InsertAt::Sorted, 30), 1);
        assert_eq!(list.insert_at(InsertAt::Sorted, 20), 1);
        assert_eq!(list.insert_at(InsertAt::Sorted, 5), 0);
    }

    #[test]
    fn test_sorted_insert_large_keeps_order() {
        let mut list: List<u64> = List::sorted();
        // A deterministic shuffle touching both halves repeatedly.
        for i in 0..200u64 {
            list.insert_at(InsertAt::Sorted, (i * 73) % 200);
            list.check_middle_invariant();
        }
        let collected: Vec<u64> = list.iter().copied().collect();
        let mut expected: Vec<u64> = (0..200).collect();
        expected.sort_unstable();
        assert_eq!(collected, expected);
    }

    #[test]
    fn test_position_of_sorted_uses_narrowing() {
        let mut list: List<u64> = List::sorted();
        for value in [2u64, 4, 6, 8, 10, 12, 14, 16] {
            list.insert_at(InsertAt::Sorted, value);
        }
        assert_eq!(list.position_of(&2), Some(0));
        assert_eq!(list.position_of(&10), Some(4));
        assert_eq!(list.position_of(&16), Some(7));
        assert_eq!(list.position_of(&5), None);
    }

    #[test]
    fn test_head_tail_deletes_keep_invariant() {
        let mut list: List<u64> = List::new();
        for i in 0..16 {
            list.insert_at(InsertAt::Tail, i);
            list.check_middle_invariant();
        }
        assert_eq!(list.delete_at(DeleteAt::Head), Some(0));
        list.check_middle_invariant();
        assert_eq!(list.delete_at(DeleteAt::Tail), Some(15));
        list.check_middle_invariant();
        assert_eq!(list.delete_at(DeleteAt::Position(3)), Some(4));
        list.check_middle_invariant();
        assert_eq!(list.len(), 13);
    }

    #[test]
    fn test_delete_not_found_returns_none() {
        let mut list: List<u64> = List::new();
        list.insert_at(InsertAt::Tail, 1);
        assert_eq!(list.delete_at(DeleteAt::FindBy(&9)), None);
        assert_eq!(list.delete_at(DeleteAt::Position(5)), None);
    }

    #[test]
    fn test_cursor_remove_advances() {
        let mut list: List<u64> = List::new();
        for i in 0..8 {
            list.insert_at(InsertAt::Tail, i);
        }

        let mut cursor = list.cursor();
        let mut removed = Vec::new();
        while !cursor.at_end() {
            if cursor.get().copied().unwrap() % 2 == 0 {
                removed.push(cursor.remove().unwrap());
            }
            cursor.move_next();
        }
        assert_eq!(removed, vec![0, 2, 4, 6]);
        let rest: Vec<u64> = list.iter().copied().collect();
        assert_eq!(rest, vec![1, 3, 5, 7]);
        list.check_middle_invariant();
    }

    #[test]
    fn test_queue_order() {
        let mut queue: List<u64> = List::new();
        queue.queue_push(1);
        queue.queue_push(2);
        queue.queue_push(3);
        assert_eq!(queue.queue_peek(), Some(&1));
        assert_eq!(queue.queue_pop(), Some(1));
        assert_eq!(queue.queue_pop(), Some(2));
        assert_eq!(queue.queue_pop(), Some(3));
        assert_eq!(queue.queue_pop(), None);
    }

    #[test]
    fn test_get_walks_from_nearest_anchor() {
        let mut list: List<u64> = List::new();
        for i in 0..101 {
            list.insert_at(InsertAt::Tail, i);
        }
        assert_eq!(list.get(0), Some(&0));
        assert_eq!(list.get(100), Some(&100));
        assert_eq!(list.get(50), Some(&50));
        assert_eq!(list.get(75), Some(&75));
        assert_eq!(list.get(101), None);
    }

    #[test]
    fn test_equality_comparator_overrides_find() {
        // Sorted by the low byte, equality on the full value.
        let mut list: List<u64> = List::sorted_by(|a, b| (a & 0xFF).cmp(&(b & 0xFF)));
        list.set_equality_comparator(|a, b| a.cmp(b));
        list.insert_at(InsertAt::Sorted, 0x101);
        list.insert_at(InsertAt::Sorted, 0x201);
        list.insert_at(InsertAt::Sorted, 0x102);
        assert_eq!(list.delete_at(DeleteAt::FindBy(&0x201)), Some(0x201));
        assert_eq!(list.len(), 2);
    }

    #[derive(Default)]
    struct MapIndexer {
        map: BTreeMap<u64, u32>,
    }

    impl Indexer<u64> for MapIndexer {
        fn index(&mut self, data: &u64, node: u32) {
            self.map.insert(*data, node);
        }
        fn unindex(&mut self, data: &u64) {
            self.map.remove(data);
        }
        fn find(&self, data: &u64) -> Option<u32> {
            self.map.get(data).copied()
        }
    }

    #[test]
    fn test_indexed_delete_calls_indexer() {
        let mut list: List<u64> =
            List::indexed(default_comparator::<u64>, Box::new(MapIndexer::default()));
        list.insert_at(InsertAt::Indexed, 10);
        list.insert_at(InsertAt::Indexed, 20);
        list.insert_at(InsertAt::Indexed, 30);
        assert_eq!(list.delete_at(DeleteAt::FindBy(&20)), Some(20));
        assert_eq!(list.delete_at(DeleteAt::FindBy(&20)), None);
        assert_eq!(list.len(), 2);
    }
}
