use super::allocator::Allocator;
use alloc::{vec, vec::Vec};

/// 使用栈结构实现分配器
///
/// 栈中每个元素 `(start, end)` 是一段连续的空闲页，分配时从栈顶那段里取一个
pub struct StackedAllocator {
    list: Vec<(usize, usize)>,
}

impl Allocator for StackedAllocator {
    fn new(capacity: usize) -> Self {
        Self {
            list: vec![(0, capacity)],
        }
    }

    fn alloc(&mut self) -> Option<usize> {
        while let Some((start, end)) = self.list.pop() {
            if start < end {
                if end - start > 1 {
                    self.list.push((start + 1, end));
                }
                return Some(start);
            }
        }
        None
    }

    fn dealloc(&mut self, index: usize) {
        self.list.push((index, index + 1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hands_out_each_index_once() {
        let mut allocator = StackedAllocator::new(3);
        let mut got = vec![
            allocator.alloc().unwrap(),
            allocator.alloc().unwrap(),
            allocator.alloc().unwrap(),
        ];
        assert_eq!(allocator.alloc(), None);
        got.sort();
        assert_eq!(got, vec![0, 1, 2]);
        allocator.dealloc(1);
        assert_eq!(allocator.alloc(), Some(1));
    }
}
