// src/depend/validate.rs

use std::collections::BTreeSet;

use super::expr::DepExpr;

/// Whether no repeat-condition lists the same alternative twice.
///
/// Alternatives are compared as sets of task names, so `A&B|B&A` is a
/// duplicate.
pub fn validate_no_duplicate_conditions(list: &DepExpr) -> bool {
    find_duplicate_condition(list).is_none()
}

/// The first repeat-condition (rendered) that contains a duplicate
/// alternative, if any.
pub fn find_duplicate_condition(list: &DepExpr) -> Option<String> {
    for condition in list.conditions() {
        let mut seen: BTreeSet<BTreeSet<String>> = BTreeSet::new();
        for alternative in condition.alternative_sets() {
            if !seen.insert(alternative) {
                return Some(condition.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::depend::expr::parse;

    #[test]
    fn detects_repeated_alternative() {
        assert!(!validate_no_duplicate_conditions(&parse("A|B|A").unwrap()));
        assert!(!validate_no_duplicate_conditions(&parse("C,A&B|B&A").unwrap()));
        assert_eq!(
            find_duplicate_condition(&parse("C,A&B|B&A").unwrap()).as_deref(),
            Some("A&B|B&A")
        );
    }

    #[test]
    fn separate_repeats_may_share_alternatives() {
        assert!(validate_no_duplicate_conditions(&parse("A|B,A").unwrap()));
        assert!(validate_no_duplicate_conditions(&parse("").unwrap()));
    }
}
