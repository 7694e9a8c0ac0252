//! Compact offset-to-statement map.
//!
//! Maps code offsets (bytecode or native) back to source statements for
//! exception attribution, debugger stepping and lazy-bailout patching.
//!
//! ## Encoding
//!
//! ```text
//!   items[i]  = | source delta (i16) | code delta (i16) |
//!               31               16 15               0
//!
//!   delta      = value[i] - value[i - 1]     (value[-1] = 0)
//!   sentinel   = i16::MAX  ->  absolute value stored in `overflow`
//! ```
//!
//! Deltas outside `[i16::MIN, i16::MAX)` are stored as the sentinel and the
//! absolute value is appended to the overflow list. Source overflow is always
//! pushed before code overflow for the same entry, and decoding consumes the
//! list in the same order.
//!
//! ## Queries
//!
//! Decoding is sequential, so every query walks forward from a caller-owned
//! [`SpanCursor`]. Monotonic queries reuse the cursor and are O(1) amortized;
//! a query behind the cursor resets it and rescans. The map itself is never
//! mutated by a query, so read-only consumers on other threads can share it
//! behind an `Arc` with one cursor each.

/// Marker stored in a packed half when the real value lives in the overflow list
pub const OVERFLOW_SENTINEL: i16 = i16::MAX;

/// One statement boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatementData {
    pub source_begin: i32,
    pub bytecode_begin: i32,
}

impl StatementData {
    pub const fn new(source_begin: i32, bytecode_begin: i32) -> Self {
        StatementData {
            source_begin,
            bytecode_begin,
        }
    }
}

/// Decoding position inside a [`CompactOffsetMap`]
///
/// `decoded == 0` means nothing has been decoded yet.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpanCursor {
    decoded: usize,
    accumulated: StatementData,
    overflow_index: usize,
    /// The entry under the cursor is the first with its code offset
    first_at_offset: bool,
}

impl SpanCursor {
    pub const fn new() -> Self {
        SpanCursor {
            decoded: 0,
            accumulated: StatementData::new(0, 0),
            overflow_index: 0,
            first_at_offset: false,
        }
    }

    /// Drop the cached position
    pub fn reset(&mut self) {
        *self = SpanCursor::new();
    }

    /// Index of the entry the cursor rests on
    pub fn current_index(&self) -> Option<usize> {
        self.decoded.checked_sub(1)
    }
}

/// Append-only delta-encoded sequence of [`StatementData`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactOffsetMap {
    items: Vec<u32>,
    overflow: Vec<i32>,
    last: StatementData,
}

impl CompactOffsetMap {
    pub const fn new() -> Self {
        CompactOffsetMap {
            items: Vec::new(),
            overflow: Vec::new(),
            last: StatementData::new(0, 0),
        }
    }

    /// Build a map from statements in recording order
    pub fn from_statements(statements: impl IntoIterator<Item = StatementData>) -> Self {
        let mut map = CompactOffsetMap::new();
        for statement in statements {
            map.record_range(statement);
        }
        map
    }

    /// Append one statement boundary
    pub fn record_range(&mut self, data: StatementData) {
        let source = Self::encode(
            data.source_begin,
            self.last.source_begin,
            &mut self.overflow,
        );
        let code = Self::encode(
            data.bytecode_begin,
            self.last.bytecode_begin,
            &mut self.overflow,
        );
        self.items.push(((source as u16 as u32) << 16) | code as u16 as u32);
        self.last = data;
    }

    fn encode(value: i32, previous: i32, overflow: &mut Vec<i32>) -> i16 {
        let delta = value as i64 - previous as i64;
        if delta >= i16::MIN as i64 && delta < OVERFLOW_SENTINEL as i64 {
            delta as i16
        } else {
            overflow.push(value);
            OVERFLOW_SENTINEL
        }
    }

    /// Decode the entry after the cursor and advance it
    fn decode_next(&self, cursor: &mut SpanCursor) -> Option<StatementData> {
        let item = *self.items.get(cursor.decoded)?;
        let source_delta = (item >> 16) as u16 as i16;
        let code_delta = item as u16 as i16;

        let source_begin = if source_delta == OVERFLOW_SENTINEL {
            let value = *self.overflow.get(cursor.overflow_index)?;
            cursor.overflow_index += 1;
            value
        } else {
            cursor.accumulated.source_begin + source_delta as i32
        };
        let bytecode_begin = if code_delta == OVERFLOW_SENTINEL {
            let value = *self.overflow.get(cursor.overflow_index)?;
            cursor.overflow_index += 1;
            value
        } else {
            cursor.accumulated.bytecode_begin + code_delta as i32
        };

        let data = StatementData::new(source_begin, bytecode_begin);
        cursor.first_at_offset =
            cursor.decoded == 0 || bytecode_begin != cursor.accumulated.bytecode_begin;
        cursor.accumulated = data;
        cursor.decoded += 1;
        Some(data)
    }

    fn is_stale(&self, cursor: &SpanCursor) -> bool {
        cursor.decoded > self.items.len() || cursor.overflow_index > self.overflow.len()
    }

    /// Statement whose code span contains `bytecode`
    ///
    /// Returns the first entry starting exactly at `bytecode`, otherwise the
    /// last entry starting before it. `None` if the map is empty or the offset
    /// precedes the first entry.
    pub fn matching_statement_from_bytecode(
        &self,
        bytecode: i32,
        cursor: &mut SpanCursor,
    ) -> Option<StatementData> {
        self.matching_entry(bytecode, cursor).map(|(_, data)| data)
    }

    /// Like [`matching_statement_from_bytecode`](Self::matching_statement_from_bytecode)
    /// but returns the entry index
    pub fn statement_index_from_bytecode(
        &self,
        bytecode: i32,
        cursor: &mut SpanCursor,
    ) -> Option<usize> {
        self.matching_entry(bytecode, cursor).map(|(index, _)| index)
    }

    fn matching_entry(
        &self,
        bytecode: i32,
        cursor: &mut SpanCursor,
    ) -> Option<(usize, StatementData)> {
        if self.items.is_empty() {
            return None;
        }
        // An exact hit on a later duplicate must rescan to reach the first
        if cursor.decoded == 0
            || self.is_stale(cursor)
            || bytecode < cursor.accumulated.bytecode_begin
            || (bytecode == cursor.accumulated.bytecode_begin && !cursor.first_at_offset)
        {
            cursor.reset();
        }

        let mut current = cursor
            .current_index()
            .map(|index| (index, cursor.accumulated));
        if let Some((_, data)) = current {
            if data.bytecode_begin == bytecode {
                return current;
            }
        }

        loop {
            let mut probe = *cursor;
            match self.decode_next(&mut probe) {
                None => return current,
                Some(next) if next.bytecode_begin > bytecode => return current,
                Some(next) => {
                    *cursor = probe;
                    current = Some((cursor.decoded - 1, next));
                    if next.bytecode_begin == bytecode {
                        return current;
                    }
                }
            }
        }
    }

    /// Entry at `index`, scanning from the cursor when possible
    pub fn item(&self, index: usize, cursor: &mut SpanCursor) -> Option<StatementData> {
        if index >= self.items.len() {
            return None;
        }
        if self.is_stale(cursor) || cursor.decoded > index + 1 {
            cursor.reset();
        }
        if cursor.decoded == index + 1 {
            return Some(cursor.accumulated);
        }
        let mut data = None;
        while cursor.decoded <= index {
            data = Some(self.decode_next(cursor)?);
        }
        data
    }

    /// Entry at `index` without a cached position
    pub fn seek(&self, index: usize) -> Option<StatementData> {
        self.item(index, &mut SpanCursor::new())
    }

    /// Code offset at which statement `index` begins
    pub fn offset_for_statement(&self, index: usize) -> Option<i32> {
        self.seek(index).map(|data| data.bytecode_begin)
    }

    /// Decode every entry in order
    pub fn iter(&self) -> impl Iterator<Item = StatementData> + '_ {
        let mut cursor = SpanCursor::new();
        std::iter::from_fn(move || self.decode_next(&mut cursor))
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Number of values that did not fit a 16-bit delta
    pub fn overflow_len(&self) -> usize {
        self.overflow.len()
    }

    /// Approximate heap footprint in bytes
    pub fn heap_size(&self) -> usize {
        self.items.capacity() * std::mem::size_of::<u32>()
            + self.overflow.capacity() * std::mem::size_of::<i32>()
    }
}

// =============================================================================
// Native throw map
// =============================================================================

/// Native code offset to statement index map of one compiled entry point
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NativeThrowMap {
    map: CompactOffsetMap,
}

impl NativeThrowMap {
    pub const fn new() -> Self {
        NativeThrowMap {
            map: CompactOffsetMap::new(),
        }
    }

    /// Build from `(native_offset, statement_index)` pairs in native order
    pub fn from_entries(entries: impl IntoIterator<Item = (u32, u32)>) -> Self {
        let mut map = NativeThrowMap::new();
        for (native_offset, statement_index) in entries {
            map.record(native_offset, statement_index);
        }
        map
    }

    pub fn record(&mut self, native_offset: u32, statement_index: u32) {
        self.map.record_range(StatementData::new(
            statement_index as i32,
            native_offset as i32,
        ));
    }

    /// Statement covering `native_offset`
    pub fn statement_index(&self, native_offset: u32, cursor: &mut SpanCursor) -> Option<u32> {
        self.map
            .matching_statement_from_bytecode(native_offset as i32, cursor)
            .map(|data| data.source_begin as u32)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CompactOffsetMap {
        CompactOffsetMap::from_statements([
            StatementData::new(0, 0),
            StatementData::new(12, 4),
            StatementData::new(30, 9),
            StatementData::new(31, 20),
        ])
    }

    #[test]
    fn test_exact_and_preceding_match() {
        let map = sample();
        let mut cursor = SpanCursor::new();
        assert_eq!(
            map.matching_statement_from_bytecode(4, &mut cursor),
            Some(StatementData::new(12, 4))
        );
        assert_eq!(
            map.matching_statement_from_bytecode(8, &mut cursor),
            Some(StatementData::new(12, 4))
        );
        assert_eq!(
            map.matching_statement_from_bytecode(100, &mut cursor),
            Some(StatementData::new(31, 20))
        );
    }

    #[test]
    fn test_backward_query_resets_cursor() {
        let map = sample();
        let mut cursor = SpanCursor::new();
        map.matching_statement_from_bytecode(20, &mut cursor);
        assert_eq!(cursor.current_index(), Some(3));
        assert_eq!(map.statement_index_from_bytecode(5, &mut cursor), Some(1));
        assert_eq!(cursor.current_index(), Some(1));
    }

    #[test]
    fn test_query_before_first_entry() {
        let map = CompactOffsetMap::from_statements([StatementData::new(3, 10)]);
        let mut cursor = SpanCursor::new();
        assert_eq!(map.matching_statement_from_bytecode(9, &mut cursor), None);
        assert_eq!(
            CompactOffsetMap::new().matching_statement_from_bytecode(0, &mut cursor),
            None
        );
    }

    #[test]
    fn test_large_deltas_use_overflow() {
        let statements = [
            StatementData::new(0, 0),
            StatementData::new(40_000, 5),
            StatementData::new(40_001, 100_000),
            StatementData::new(-70_000, 100_001),
            StatementData::new(-70_000 + i16::MAX as i32, 100_002),
        ];
        let map = CompactOffsetMap::from_statements(statements);
        // 40_000, 100_000, -70_000 and the exact-sentinel delta
        assert_eq!(map.overflow_len(), 4);
        let decoded: Vec<_> = map.iter().collect();
        assert_eq!(decoded, statements.to_vec());

        let mut cursor = SpanCursor::new();
        for statement in statements {
            assert_eq!(
                map.matching_statement_from_bytecode(statement.bytecode_begin, &mut cursor),
                Some(statement)
            );
        }
    }

    #[test]
    fn test_item_and_seek() {
        let map = sample();
        let mut cursor = SpanCursor::new();
        assert_eq!(map.item(2, &mut cursor), Some(StatementData::new(30, 9)));
        assert_eq!(map.item(2, &mut cursor), Some(StatementData::new(30, 9)));
        assert_eq!(map.item(0, &mut cursor), Some(StatementData::new(0, 0)));
        assert_eq!(map.item(9, &mut cursor), None);
        assert_eq!(map.seek(3), Some(StatementData::new(31, 20)));
        assert_eq!(map.offset_for_statement(1), Some(4));
    }

    #[test]
    fn test_duplicate_offsets_return_first() {
        let map = CompactOffsetMap::from_statements([
            StatementData::new(1, 0),
            StatementData::new(2, 6),
            StatementData::new(3, 6),
        ]);
        let mut cursor = SpanCursor::new();
        assert_eq!(map.statement_index_from_bytecode(6, &mut cursor), Some(1));
        assert_eq!(map.statement_index_from_bytecode(6, &mut cursor), Some(1));
    }

    #[test]
    fn test_cursor_on_later_duplicate_rescans_to_first() {
        let map = CompactOffsetMap::from_statements([
            StatementData::new(1, 0),
            StatementData::new(2, 6),
            StatementData::new(3, 6),
            StatementData::new(4, 6),
            StatementData::new(5, 9),
        ]);
        let mut cursor = SpanCursor::new();
        assert_eq!(map.item(3, &mut cursor), Some(StatementData::new(4, 6)));
        assert_eq!(map.statement_index_from_bytecode(6, &mut cursor), Some(1));
        assert_eq!(cursor.current_index(), Some(1));
        // Moving on from the first duplicate still scans forward
        assert_eq!(map.statement_index_from_bytecode(7, &mut cursor), Some(3));
        assert_eq!(map.statement_index_from_bytecode(9, &mut cursor), Some(4));
    }

    #[test]
    fn test_cursor_from_longer_map_is_reset() {
        let long = sample();
        let short = CompactOffsetMap::from_statements([StatementData::new(7, 0)]);
        let mut cursor = SpanCursor::new();
        long.matching_statement_from_bytecode(20, &mut cursor);
        assert_eq!(
            short.matching_statement_from_bytecode(50, &mut cursor),
            Some(StatementData::new(7, 0))
        );
    }

    #[test]
    fn test_native_throw_map() {
        let map = NativeThrowMap::from_entries([(0, 0), (16, 1), (48, 3), (70_000, 4)]);
        let mut cursor = SpanCursor::new();
        assert_eq!(map.statement_index(20, &mut cursor), Some(1));
        assert_eq!(map.statement_index(48, &mut cursor), Some(3));
        assert_eq!(map.statement_index(80_000, &mut cursor), Some(4));
        assert_eq!(map.len(), 4);
    }
}
