//
// position.rs
//
// Line/column coordinates with an explicit base
//

use std::cmp::Ordering;
use std::fmt;

/// Numbering base of a [`Position`].
///
/// Editors speak zero-based coordinates, the build engine reports one-based
/// coordinates. The base travels with every position so the two never mix
/// without an explicit conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Base {
    Zero,
    One,
}

impl Base {
    fn origin(self) -> u32 {
        match self {
            Base::Zero => 0,
            Base::One => 1,
        }
    }
}

/// A (line, column) location tagged with its numbering base.
///
/// Positions only compare against positions of the same base: `partial_cmp`
/// returns `None` across bases and `==` is false.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Position {
    line: u32,
    column: u32,
    base: Base,
}

impl Position {
    /// Create a position in the given base.
    ///
    /// Returns `None` when a coordinate is below the base's origin (for
    /// example line 0 in a one-based position).
    pub fn new(line: u32, column: u32, base: Base) -> Option<Self> {
        let origin = base.origin();
        if line < origin || column < origin {
            return None;
        }
        Some(Self { line, column, base })
    }

    /// Zero-based position. Always valid.
    pub fn zero_based(line: u32, column: u32) -> Self {
        Self {
            line,
            column,
            base: Base::Zero,
        }
    }

    /// One-based position, or `None` if either coordinate is zero.
    pub fn one_based(line: u32, column: u32) -> Option<Self> {
        Self::new(line, column, Base::One)
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    pub fn column(&self) -> u32 {
        self.column
    }

    pub fn base(&self) -> Base {
        self.base
    }

    /// Convert to the requested base. Coordinates at `u32::MAX` stay there
    /// when moving to one-based.
    pub fn to_base(self, base: Base) -> Self {
        if self.base == base {
            return self;
        }
        match base {
            Base::Zero => Self::zero_based(self.line - 1, self.column - 1),
            Base::One => Self {
                line: self.line.saturating_add(1),
                column: self.column.saturating_add(1),
                base: Base::One,
            },
        }
    }

    pub fn to_zero_based(self) -> Self {
        self.to_base(Base::Zero)
    }

    pub fn to_one_based(self) -> Self {
        self.to_base(Base::One)
    }
}

impl PartialOrd for Position {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.base != other.base {
            return None;
        }
        Some(
            self.line
                .cmp(&other.line)
                .then(self.column.cmp(&other.column)),
        )
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// An ordered pair of positions sharing one base.
///
/// Containment is start-inclusive and end-exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Range {
    start: Position,
    end: Position,
}

impl Range {
    /// Create a range. Returns `None` if the bases differ or `end < start`.
    pub fn new(start: Position, end: Position) -> Option<Self> {
        match start.partial_cmp(&end)? {
            Ordering::Greater => None,
            _ => Some(Self { start, end }),
        }
    }

    /// Build from endpoints already known to share a base and be ordered.
    pub(crate) fn from_ordered(start: Position, end: Position) -> Self {
        debug_assert!(matches!(
            start.partial_cmp(&end),
            Some(Ordering::Less | Ordering::Equal)
        ));
        Self { start, end }
    }

    pub fn start(&self) -> Position {
        self.start
    }

    pub fn end(&self) -> Position {
        self.end
    }

    pub fn base(&self) -> Base {
        self.start.base
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Whether `position` lies in `[start, end)`. Positions of another base
    /// are never contained.
    pub fn contains(&self, position: Position) -> bool {
        matches!(
            self.start.partial_cmp(&position),
            Some(Ordering::Less | Ordering::Equal)
        ) && matches!(self.end.partial_cmp(&position), Some(Ordering::Greater))
    }

    pub fn to_base(self, base: Base) -> Self {
        Self {
            start: self.start.to_base(base),
            end: self.end.to_base(base),
        }
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}
