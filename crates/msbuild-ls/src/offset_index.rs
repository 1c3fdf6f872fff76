//
// offset_index.rs
//
// Character offset <-> line/column translation for one text snapshot
//

use std::cmp::Ordering;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use thiserror::Error;

use crate::position::{Base, Position, Range};

static NEXT_INDEX_ID: AtomicU64 = AtomicU64::new(1);

/// Precondition failures for coordinate lookups and arithmetic.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PositionError {
    #[error("offset {offset} is outside the text (length {length})")]
    OffsetOutOfRange { offset: usize, length: usize },
    #[error("line {line} is outside the text ({line_count} lines)")]
    LineOutOfRange { line: u32, line_count: usize },
    #[error("column {column} is past the end of line {line} (max {max})")]
    ColumnOutOfRange { line: u32, column: u32, max: u32 },
    #[error("positions belong to different text snapshots (index #{left} vs #{right})")]
    IncompatibleIndex { left: u64, right: u64 },
    #[error("range start {start} is after its end {end}")]
    InvertedRange { start: usize, end: usize },
    #[error("translation moves a coordinate below zero")]
    Underflow,
}

/// Immutable line table for one text snapshot.
///
/// Built in a single pass; every lookup afterwards is a binary search over
/// the line-start table. `\r\n`, `\n` and a lone `\r` each count as exactly
/// one line break. Offsets count Unicode scalar values (`char`s).
pub struct OffsetIndex {
    id: u64,
    len: usize,
    /// Offset of the first character of every line.
    line_starts: Vec<usize>,
    /// Offset just past the last content character of every line (before its break).
    line_ends: Vec<usize>,
}

impl fmt::Debug for OffsetIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OffsetIndex")
            .field("id", &self.id)
            .field("len", &self.len)
            .field("lines", &self.line_starts.len())
            .finish()
    }
}

impl OffsetIndex {
    pub fn new(text: &str) -> Self {
        let mut line_starts = vec![0];
        let mut line_ends = Vec::new();
        let mut chars = text.chars().peekable();
        let mut offset = 0;

        while let Some(ch) = chars.next() {
            match ch {
                '\r' => {
                    line_ends.push(offset);
                    offset += 1;
                    if chars.peek() == Some(&'\n') {
                        chars.next();
                        offset += 1;
                    }
                    line_starts.push(offset);
                }
                '\n' => {
                    line_ends.push(offset);
                    offset += 1;
                    line_starts.push(offset);
                }
                _ => offset += 1,
            }
        }
        line_ends.push(offset);

        Self {
            id: NEXT_INDEX_ID.fetch_add(1, AtomicOrdering::Relaxed),
            len: offset,
            line_starts,
            line_ends,
        }
    }

    /// Convenience constructor for the shared form every TextPosition refers to.
    pub fn shared(text: &str) -> Arc<Self> {
        Arc::new(Self::new(text))
    }

    /// Process-unique identity of this snapshot, used in diagnostics and logs.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Length of the text in characters.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn line_count(&self) -> usize {
        self.line_starts.len()
    }

    /// Offset of the first character of `line` (zero-based).
    pub fn line_start(&self, line: u32) -> Result<usize, PositionError> {
        self.line_starts
            .get(line as usize)
            .copied()
            .ok_or(PositionError::LineOutOfRange {
                line,
                line_count: self.line_count(),
            })
    }

    /// Number of content characters on `line`, excluding its line break.
    pub fn line_length(&self, line: u32) -> Result<usize, PositionError> {
        let start = self.line_start(line)?;
        Ok(self.line_ends[line as usize] - start)
    }

    /// Largest zero-based column addressable on `line`.
    ///
    /// One past the last content character is always valid. On a `\r\n`
    /// line the column between `\r` and `\n` is also addressable so that
    /// every offset of the text maps back to itself.
    fn max_column(&self, line: usize) -> usize {
        let start = self.line_starts[line];
        match self.line_starts.get(line + 1) {
            Some(next) => next - start - 1,
            None => self.len - start,
        }
    }

    /// Zero-based position of `offset`, which must satisfy `0 <= offset <= len`.
    pub fn position_of(&self, offset: usize) -> Result<Position, PositionError> {
        if offset > self.len {
            return Err(PositionError::OffsetOutOfRange {
                offset,
                length: self.len,
            });
        }
        let line = self.line_starts.partition_point(|&start| start <= offset) - 1;
        let column = offset - self.line_starts[line];
        Ok(Position::zero_based(line as u32, column as u32))
    }

    /// Offset of `position`, accepting either base.
    pub fn offset_of(&self, position: Position) -> Result<usize, PositionError> {
        let position = position.to_zero_based();
        let line = position.line() as usize;
        if line >= self.line_count() {
            return Err(PositionError::LineOutOfRange {
                line: position.line(),
                line_count: self.line_count(),
            });
        }
        let max = self.max_column(line);
        if position.column() as usize > max {
            return Err(PositionError::ColumnOutOfRange {
                line: position.line(),
                column: position.column(),
                max: max as u32,
            });
        }
        Ok(self.line_starts[line] + position.column() as usize)
    }

    /// Bind `offset` to this snapshot.
    pub fn text_position_of(self: &Arc<Self>, offset: usize) -> Result<TextPosition, PositionError> {
        let position = self.position_of(offset)?;
        Ok(TextPosition {
            index: Arc::clone(self),
            offset,
            position,
        })
    }

    /// Bind `position` (either base) to this snapshot.
    pub fn text_position_at(
        self: &Arc<Self>,
        position: Position,
    ) -> Result<TextPosition, PositionError> {
        let offset = self.offset_of(position)?;
        self.text_position_of(offset)
    }

    /// Bind the offset span `start..end` to this snapshot.
    pub fn text_range(self: &Arc<Self>, start: usize, end: usize) -> Result<TextRange, PositionError> {
        TextRange::new(self.text_position_of(start)?, self.text_position_of(end)?)
    }

    /// Range over offsets produced while scanning this snapshot. Offsets are
    /// clamped to the text and ordered, so construction cannot fail.
    pub(crate) fn span(self: &Arc<Self>, start: usize, end: usize) -> TextRange {
        let end = end.min(self.len);
        let start = start.min(end);
        let at = |offset: usize| {
            let line = self.line_starts.partition_point(|&s| s <= offset) - 1;
            TextPosition {
                index: Arc::clone(self),
                offset,
                position: Position::zero_based(
                    line as u32,
                    (offset - self.line_starts[line]) as u32,
                ),
            }
        };
        TextRange {
            start: at(start),
            end: at(end),
        }
    }
}

/// Maps UTF-8 byte offsets (what tree-sitter reports) onto the character
/// offsets an [`OffsetIndex`] works in.
pub struct ByteOffsets {
    /// Byte offset of every character. Empty for ASCII text, where the two
    /// coordinates coincide.
    char_starts: Vec<usize>,
    len: usize,
}

impl ByteOffsets {
    pub fn new(text: &str) -> Self {
        let char_starts = if text.is_ascii() {
            Vec::new()
        } else {
            text.char_indices().map(|(byte, _)| byte).collect()
        };
        Self {
            char_starts,
            len: text.len(),
        }
    }

    /// Character offset of `byte`. A byte inside a multi-byte character maps
    /// to that character; bytes past the end clamp to the text length.
    pub fn char_offset(&self, byte: usize) -> usize {
        let byte = byte.min(self.len);
        if self.char_starts.is_empty() {
            return byte;
        }
        match self.char_starts.binary_search(&byte) {
            Ok(index) => index,
            Err(index) if byte == self.len => index,
            Err(index) => index - 1,
        }
    }
}

fn ensure_same_index(left: &Arc<OffsetIndex>, right: &Arc<OffsetIndex>) -> Result<(), PositionError> {
    if Arc::ptr_eq(left, right) {
        Ok(())
    } else {
        Err(PositionError::IncompatibleIndex {
            left: left.id,
            right: right.id,
        })
    }
}

fn apply_delta(value: usize, delta: isize) -> Result<usize, PositionError> {
    value.checked_add_signed(delta).ok_or(PositionError::Underflow)
}

/// A position bound to the [`OffsetIndex`] that produced it.
///
/// Two text positions only compare or combine when they share the same
/// index instance; anything else is an [`PositionError::IncompatibleIndex`].
#[derive(Clone)]
pub struct TextPosition {
    index: Arc<OffsetIndex>,
    offset: usize,
    position: Position,
}

impl fmt::Debug for TextPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TextPosition(#{} @{} {})", self.index.id, self.offset, self.position)
    }
}

impl PartialEq for TextPosition {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.index, &other.index) && self.offset == other.offset
    }
}

impl Eq for TextPosition {}

impl TextPosition {
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Zero-based line/column.
    pub fn position(&self) -> Position {
        self.position
    }

    pub fn line(&self) -> u32 {
        self.position.line()
    }

    pub fn column(&self) -> u32 {
        self.position.column()
    }

    pub fn index(&self) -> &Arc<OffsetIndex> {
        &self.index
    }

    pub fn same_index(&self, other: &TextPosition) -> bool {
        Arc::ptr_eq(&self.index, &other.index)
    }

    pub fn compare(&self, other: &TextPosition) -> Result<Ordering, PositionError> {
        ensure_same_index(&self.index, &other.index)?;
        Ok(self.offset.cmp(&other.offset))
    }

    /// Signed character distance from `other` to `self`.
    pub fn distance_from(&self, other: &TextPosition) -> Result<isize, PositionError> {
        ensure_same_index(&self.index, &other.index)?;
        Ok(self.offset as isize - other.offset as isize)
    }

    /// The position `delta` characters away in the same snapshot.
    pub fn moved_by(&self, delta: isize) -> Result<TextPosition, PositionError> {
        self.index.text_position_of(apply_delta(self.offset, delta)?)
    }

    /// The same offset resolved against another snapshot.
    pub fn rebased(&self, index: &Arc<OffsetIndex>) -> Result<TextPosition, PositionError> {
        index.text_position_of(self.offset)
    }
}

/// A start-inclusive, end-exclusive span of [`TextPosition`]s from one snapshot.
#[derive(Clone, PartialEq, Eq)]
pub struct TextRange {
    start: TextPosition,
    end: TextPosition,
}

impl fmt::Debug for TextRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TextRange(#{} {}..{})",
            self.start.index.id, self.start.offset, self.end.offset
        )
    }
}

impl TextRange {
    pub fn new(start: TextPosition, end: TextPosition) -> Result<Self, PositionError> {
        if start.compare(&end)? == Ordering::Greater {
            return Err(PositionError::InvertedRange {
                start: start.offset,
                end: end.offset,
            });
        }
        Ok(Self { start, end })
    }

    /// Zero-width range at `position`.
    pub fn empty_at(position: TextPosition) -> Self {
        Self {
            end: position.clone(),
            start: position,
        }
    }

    pub fn start(&self) -> &TextPosition {
        &self.start
    }

    pub fn end(&self) -> &TextPosition {
        &self.end
    }

    pub fn absolute_start(&self) -> usize {
        self.start.offset
    }

    pub fn absolute_end(&self) -> usize {
        self.end.offset
    }

    pub fn len(&self) -> usize {
        self.end.offset - self.start.offset
    }

    pub fn is_empty(&self) -> bool {
        self.start.offset == self.end.offset
    }

    pub fn index(&self) -> &Arc<OffsetIndex> {
        &self.start.index
    }

    /// Zero-based line/column range.
    pub fn range(&self) -> Range {
        Range::from_ordered(self.start.position, self.end.position)
    }

    /// Whether `offset` lies in `[start, end)`.
    pub fn contains_offset(&self, offset: usize) -> bool {
        self.start.offset <= offset && offset < self.end.offset
    }

    /// Whether `position` lies in `[start, end)`; fails across snapshots.
    pub fn contains(&self, position: &TextPosition) -> Result<bool, PositionError> {
        ensure_same_index(self.index(), &position.index)?;
        Ok(self.contains_offset(position.offset))
    }

    /// Whether `other` lies entirely within this range.
    pub fn encloses(&self, other: &TextRange) -> Result<bool, PositionError> {
        ensure_same_index(self.index(), other.index())?;
        Ok(self.start.offset <= other.start.offset && other.end.offset <= self.end.offset)
    }

    /// Shift both ends by `delta` characters within the same snapshot.
    pub fn translated_by_offset(&self, delta: isize) -> Result<TextRange, PositionError> {
        TextRange::new(self.start.moved_by(delta)?, self.end.moved_by(delta)?)
    }

    /// Shift both ends by a line and column delta within the same snapshot.
    pub fn translated_by_lines(
        &self,
        line_delta: i64,
        column_delta: i64,
    ) -> Result<TextRange, PositionError> {
        let shift = |position: &TextPosition| -> Result<TextPosition, PositionError> {
            let line = i64::from(position.line()) + line_delta;
            let column = i64::from(position.column()) + column_delta;
            if line < 0 || column < 0 {
                return Err(PositionError::Underflow);
            }
            let target = Position::new(line as u32, column as u32, Base::Zero)
                .ok_or(PositionError::Underflow)?;
            position.index.text_position_at(target)
        };
        TextRange::new(shift(&self.start)?, shift(&self.end)?)
    }

    /// The same offsets resolved against another snapshot, optionally shifted.
    pub fn rebased(&self, index: &Arc<OffsetIndex>, delta: isize) -> Result<TextRange, PositionError> {
        index.text_range(
            apply_delta(self.start.offset, delta)?,
            apply_delta(self.end.offset, delta)?,
        )
    }
}
