use std::collections::VecDeque;
use std::io::Result;

use crate::elements::ReaderElement;

/// One batch of decoded elements from the PBF collaborator.
pub struct ElementBlock {
    pub idx: i64,
    pub elements: Vec<ReaderElement>,
}

impl ElementBlock {
    pub fn new(idx: i64, elements: Vec<ReaderElement>) -> ElementBlock {
        ElementBlock {
            idx: idx,
            elements: elements,
        }
    }
}

/// The seam to the PBF decoder: a lazy, finite sequence of element
/// blocks. Decoding parallelism lives behind this trait; the reader
/// only pulls.
pub trait ElementSource {
    fn next_block(&mut self) -> Result<Option<ElementBlock>>;

    /// For progress reporting; zero when unknown.
    fn total_bytes(&self) -> u64 {
        0
    }
    fn position_bytes(&self) -> u64 {
        0
    }
}

/// In-memory source, for tests and small embedded inputs.
pub struct VecSource {
    blocks: VecDeque<ElementBlock>,
}

impl VecSource {
    pub fn new(elements: Vec<ReaderElement>, block_size: usize) -> VecSource {
        assert!(block_size > 0);
        let mut blocks = VecDeque::new();
        let mut idx = 0;
        let mut elements = elements;
        while !elements.is_empty() {
            let rest = elements.split_off(usize::min(block_size, elements.len()));
            blocks.push_back(ElementBlock::new(idx, elements));
            elements = rest;
            idx += 1;
        }
        VecSource { blocks: blocks }
    }
}

impl ElementSource for VecSource {
    fn next_block(&mut self) -> Result<Option<ElementBlock>> {
        Ok(self.blocks.pop_front())
    }
}
