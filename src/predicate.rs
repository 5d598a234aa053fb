//! Predicates used for matching against memory.

use std::{fmt, str, sync::Arc};

/// What a scan is filtering for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScanKind {
    /// Accept every element; the snapshot itself is the result.
    UnknownValue,
    IncreasedValue,
    DecreasedValue,
    ExactValue,
    IncreasedBy,
    DecreasedBy,
    SmallerThan,
    BiggerThan,
    Changed,
    Unchanged,
    ValueBetween,
}

impl ScanKind {
    /// Kinds that compare against the element's own snapshot value instead
    /// of a user-supplied reference.
    pub fn compares_snapshot(self) -> bool {
        matches!(
            self,
            ScanKind::Changed
                | ScanKind::Unchanged
                | ScanKind::IncreasedValue
                | ScanKind::DecreasedValue
        )
    }
}

/// The scalar interpretation of a scanned element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
}

impl ElementType {
    /// The size in memory that an element has.
    pub fn size(self) -> usize {
        match self {
            ElementType::U8 => 1,
            ElementType::U16 => 2,
            ElementType::U32 => 4,
            ElementType::U64 => 8,
            ElementType::F32 => 4,
            ElementType::F64 => 8,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, ElementType::F32 | ElementType::F64)
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ElementType::U8 => "u8",
            ElementType::U16 => "u16",
            ElementType::U32 => "u32",
            ElementType::U64 => "u64",
            ElementType::F32 => "f32",
            ElementType::F64 => "f64",
        };

        s.fmt(fmt)
    }
}

impl str::FromStr for ElementType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ty = match s {
            "u8" => ElementType::U8,
            "u16" => ElementType::U16,
            "u32" => ElementType::U32,
            "u64" => ElementType::U64,
            "f32" => ElementType::F32,
            "f64" => ElementType::F64,
            other => anyhow::bail!("bad element type: {}", other),
        };

        Ok(ty)
    }
}

/// A pure test over zero-extended 64-bit operands.
///
/// `a` is the candidate value, `b` the first reference and `c` the optional
/// second reference (the delta for `increased_by`/`decreased_by`, the upper
/// bound for `value_between`).
pub type Comparator = Arc<dyn Fn(u64, u64, Option<u64>) -> bool + Send + Sync>;

/// Build the comparator for a predicate kind over a given element type.
///
/// `unknown_value` is special-cased upstream and never matches here.
pub fn comparator(kind: ScanKind, ty: ElementType) -> Comparator {
    match ty {
        ElementType::F32 => Arc::new(move |a, b, c| {
            let a = f32::from_bits(a as u32);
            let b = f32::from_bits(b as u32);
            let c = c.map(|c| f32::from_bits(c as u32));

            const EPS: f32 = 0.01;

            match kind {
                ScanKind::ExactValue | ScanKind::Unchanged => (a - b).abs() <= EPS,
                ScanKind::IncreasedValue | ScanKind::BiggerThan => a > b + EPS,
                ScanKind::DecreasedValue | ScanKind::SmallerThan => a < b - EPS,
                ScanKind::Changed => (a - b).abs() > EPS,
                ScanKind::IncreasedBy => c.map_or(false, |c| ((a - b) - c).abs() <= EPS),
                ScanKind::DecreasedBy => c.map_or(false, |c| ((b - a) - c).abs() <= EPS),
                ScanKind::ValueBetween => c.map_or(false, |c| a > b + EPS && a < c - EPS),
                ScanKind::UnknownValue => false,
            }
        }),
        ElementType::F64 => Arc::new(move |a, b, c| {
            let a = f64::from_bits(a);
            let b = f64::from_bits(b);
            let c = c.map(f64::from_bits);

            // Orderings get a tolerance; equality stays exact.
            const EPS: f64 = 1e-7;

            match kind {
                ScanKind::ExactValue | ScanKind::Unchanged => a == b,
                ScanKind::IncreasedValue => a > b,
                ScanKind::DecreasedValue => a < b,
                ScanKind::BiggerThan => a > b + EPS,
                ScanKind::SmallerThan => a < b - EPS,
                ScanKind::Changed => a != b,
                ScanKind::IncreasedBy => c.map_or(false, |c| a - b == c),
                ScanKind::DecreasedBy => c.map_or(false, |c| b - a == c),
                ScanKind::ValueBetween => c.map_or(false, |c| a > b && a < c),
                ScanKind::UnknownValue => false,
            }
        }),
        _ => Arc::new(move |a, b, c| match kind {
            ScanKind::ExactValue | ScanKind::Unchanged => a == b,
            ScanKind::IncreasedValue | ScanKind::BiggerThan => a > b,
            ScanKind::DecreasedValue | ScanKind::SmallerThan => a < b,
            ScanKind::Changed => a != b,
            ScanKind::IncreasedBy => c.map_or(false, |c| a.wrapping_sub(b) == c),
            ScanKind::DecreasedBy => c.map_or(false, |c| b.wrapping_sub(a) == c),
            ScanKind::ValueBetween => c.map_or(false, |c| a > b && a < c),
            ScanKind::UnknownValue => false,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::{comparator, ElementType, ScanKind};

    #[test]
    fn test_integer_comparators() {
        let eq = comparator(ScanKind::ExactValue, ElementType::U32);
        assert!(eq(2, 2, None));
        assert!(!eq(2, 3, None));

        let gt = comparator(ScanKind::BiggerThan, ElementType::U32);
        assert!(gt(3, 2, None));
        assert!(!gt(2, 2, None));

        let between = comparator(ScanKind::ValueBetween, ElementType::U32);
        assert!(between(5, 1, Some(10)));
        assert!(!between(1, 1, Some(10)));
        assert!(!between(10, 1, Some(10)));
    }

    #[test]
    fn test_missing_second_reference_never_matches() {
        for kind in [
            ScanKind::ValueBetween,
            ScanKind::IncreasedBy,
            ScanKind::DecreasedBy,
        ] {
            let cmp = comparator(kind, ElementType::U32);
            assert!(!cmp(5, 1, None));
        }
    }

    #[test]
    fn test_increased_by_u8() {
        let cmp = comparator(ScanKind::IncreasedBy, ElementType::U8);

        // 10 -> 13 is an increase of exactly 3.
        assert!(cmp(13, 10, Some(3)));
        assert!(!cmp(13, 10, Some(4)));
    }

    #[test]
    fn test_float_exact_tolerance() {
        let cmp = comparator(ScanKind::ExactValue, ElementType::F32);

        let v = 1.000f32.to_bits() as u64;
        assert!(cmp(v, 1.005f32.to_bits() as u64, None));
        assert!(!cmp(v, 1.02f32.to_bits() as u64, None));
    }

    #[test]
    fn test_float_orderings() {
        let bigger = comparator(ScanKind::BiggerThan, ElementType::F32);

        let a = 1.02f32.to_bits() as u64;
        let b = 1.0f32.to_bits() as u64;
        assert!(bigger(a, b, None));
        // Within tolerance of the reference does not count as bigger.
        assert!(!bigger(1.005f32.to_bits() as u64, b, None));
    }

    #[test]
    fn test_double_exact_is_exact() {
        let cmp = comparator(ScanKind::ExactValue, ElementType::F64);

        let v = 1.0f64.to_bits();
        assert!(cmp(v, v, None));
        assert!(!cmp(v, 1.000001f64.to_bits(), None));
    }

    #[test]
    fn test_double_ordering_tolerance() {
        let bigger = comparator(ScanKind::BiggerThan, ElementType::F64);

        let b = 1.0f64.to_bits();
        assert!(bigger(1.001f64.to_bits(), b, None));
        assert!(!bigger(1.00000001f64.to_bits(), b, None));
    }

    #[test]
    fn test_unknown_value_never_matches() {
        let cmp = comparator(ScanKind::UnknownValue, ElementType::U32);
        assert!(!cmp(1, 1, None));
    }

    #[test]
    fn test_element_type_size_and_parse() {
        assert_eq!(ElementType::U16.size(), 2);
        assert_eq!(ElementType::F64.size(), 8);
        assert!(ElementType::F32.is_float());
        assert!(!ElementType::U64.is_float());

        assert_eq!(str::parse::<ElementType>("u32").unwrap(), ElementType::U32);
        assert!(str::parse::<ElementType>("i32").is_err());
        assert_eq!(ElementType::F32.to_string(), "f32");
    }
}
