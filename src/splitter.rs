//! Buffer splitter: re-partitions wide buffers into minimal covering runs.
//!
//! A format-level buffer can span a whole storage even when only small,
//! scattered tensors live in it. Wrapping a reader in [`BufferSplitter`]
//! replaces each underlying buffer with the smallest set of sub-buffers
//! such that tensors sharing bytes stay together: tensors are sorted by
//! start offset and joined into a run while a tensor starts strictly
//! before the furthest end seen so far. Non-overlapping tensors become
//! singleton buffers, which keeps resident memory proportional to one
//! tensor at a time for well-behaved files.

use std::borrow::Cow;
use std::collections::VecDeque;

use crate::error::{Error, StorageError};
use crate::models::TensorInfo;
use crate::reader::TensorReader;
use crate::storage::ReadFlags;

struct Split {
    /// Offset within the underlying buffer.
    offset: u64,
    size: u64,
    /// Tensor infos rebased to this split's origin.
    tensors: Vec<TensorInfo>,
}

impl std::fmt::Debug for BufferSplitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferSplitter").finish_non_exhaustive()
    }
}

/// Wraps a [`TensorReader`] and presents smaller buffers.
pub struct BufferSplitter {
    inner: Box<dyn TensorReader>,
    /// Splits of the current underlying buffer not yet surfaced.
    queue: VecDeque<Split>,
    current: Option<Split>,
    /// Bytes consumed from the current underlying buffer.
    inner_consumed: u64,
    /// Cursor within the current split.
    position: u64,
}

impl BufferSplitter {
    pub fn new(inner: Box<dyn TensorReader>) -> Self {
        BufferSplitter {
            inner,
            queue: VecDeque::new(),
            current: None,
            inner_consumed: 0,
            position: 0,
        }
    }

    fn compute_splits(tensors: &[TensorInfo], buffer_size: u64) -> VecDeque<Split> {
        if tensors.is_empty() {
            // Preserve the "buffer exists" signal with one empty split.
            return VecDeque::from([Split {
                offset: 0,
                size: buffer_size,
                tensors: Vec::new(),
            }]);
        }
        let mut sorted: Vec<TensorInfo> = tensors.to_vec();
        sorted.sort_by_key(|t| t.offset_start);

        let mut splits = VecDeque::new();
        let mut run: Vec<TensorInfo> = Vec::new();
        let mut run_start = 0u64;
        let mut run_end = 0u64;
        for tensor in sorted {
            if run.is_empty() {
                run_start = tensor.offset_start;
                run_end = tensor.end_offset();
                run.push(tensor);
                continue;
            }
            if tensor.offset_start < run_end {
                // Transitive overlap: extend the current run.
                run_end = run_end.max(tensor.end_offset());
                run.push(tensor);
            } else {
                splits.push_back(Self::finish_run(run, run_start, run_end));
                run_start = tensor.offset_start;
                run_end = tensor.end_offset();
                run = vec![tensor];
            }
        }
        splits.push_back(Self::finish_run(run, run_start, run_end));
        splits
    }

    fn finish_run(mut run: Vec<TensorInfo>, start: u64, end: u64) -> Split {
        for tensor in &mut run {
            tensor.offset_start -= start;
        }
        Split {
            offset: start,
            size: end - start,
            tensors: run,
        }
    }

    /// Discards underlying bytes up to the current split's cursor.
    fn skip_to(&mut self, target: u64) -> Result<(), Error> {
        while self.inner_consumed < target {
            let chunk = (target - self.inner_consumed).min(65536);
            let n = self
                .inner
                .read(chunk, ReadFlags::TEMPORARY | ReadFlags::ALLOW_PARTIAL)?
                .len() as u64;
            if n == 0 {
                return Err(StorageError::UnexpectedEof.into());
            }
            self.inner_consumed += n;
        }
        Ok(())
    }
}

impl TensorReader for BufferSplitter {
    fn read_next_buffer(&mut self) -> Result<bool, Error> {
        if let Some(split) = self.queue.pop_front() {
            self.current = Some(split);
            self.position = 0;
            return Ok(true);
        }
        if !self.inner.read_next_buffer()? {
            self.current = None;
            return Ok(false);
        }
        self.queue = Self::compute_splits(self.inner.tensors_in_buffer(), self.inner.buffer_size());
        self.inner_consumed = 0;
        self.current = self.queue.pop_front();
        self.position = 0;
        Ok(true)
    }

    fn tensors_in_buffer(&self) -> &[TensorInfo] {
        match &self.current {
            Some(split) => &split.tensors,
            None => &[],
        }
    }

    fn buffer_size(&self) -> u64 {
        match &self.current {
            Some(split) => split.size,
            None => 0,
        }
    }

    fn read(&mut self, length: u64, flags: ReadFlags) -> Result<Cow<'_, [u8]>, Error> {
        let (target, remaining) = match &self.current {
            Some(split) => (split.offset + self.position, split.size - self.position),
            None => (0, 0),
        };
        let clamped = length.min(remaining);
        if clamped == 0 {
            if length > 0 && !flags.allow_empty && !flags.allow_partial {
                return Err(StorageError::UnexpectedEof.into());
            }
            return Ok(Cow::Borrowed(&[]));
        }
        self.skip_to(target)?;
        let out = self.inner.read(clamped, flags)?;
        if !flags.peek {
            let n = out.len() as u64;
            self.inner_consumed += n;
            self.position += n;
        }
        Ok(out)
    }

    fn read_all_tensor_infos(&mut self) -> Result<Vec<TensorInfo>, Error> {
        let mut infos: Vec<TensorInfo> = self
            .queue
            .drain(..)
            .flat_map(|split| split.tensors)
            .map(|t| t.with_unknown_offset())
            .collect();
        infos.extend(self.inner.read_all_tensor_infos()?);
        Ok(infos)
    }
}
