// src/expr/validator.rs
//! Validity checks for alarm definitions and definition updates.
//!
//! An update may change thresholds, operators, functions and window
//! settings, but it must keep the metric identity of every positional
//! sub-expression and may not touch `match_by`: live processors carry
//! sample windows over an update, and those windows are only meaningful
//! while each position still watches the same metric stream.

use super::parser;
use crate::types::AlarmDefinition;

/// A definition is valid when it is named and its expression parses.
pub fn is_valid_definition(def: &AlarmDefinition) -> bool {
    !def.name.trim().is_empty() && parser::parse(&def.expression).is_ok()
}

/// Whether `new` is an acceptable replacement for `old`.
pub fn is_valid_update(old: &AlarmDefinition, new: &AlarmDefinition) -> bool {
    if !is_valid_definition(old) || !is_valid_definition(new) {
        return false;
    }
    if old.match_by != new.match_by {
        return false;
    }

    let old_tree = match parser::parse(&old.expression) {
        Ok(tree) => tree,
        Err(_) => return false,
    };
    let new_tree = match parser::parse(&new.expression) {
        Ok(tree) => tree,
        Err(_) => return false,
    };
    let old_leaves = old_tree.leaves();
    let new_leaves = new_tree.leaves();
    if old_leaves.len() != new_leaves.len() {
        return false;
    }

    old_leaves.iter().zip(new_leaves.iter()).all(|(o, n)| {
        o.metric_name == n.metric_name && o.dimensions == n.dimensions
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(expression: &str, match_by: &[&str]) -> AlarmDefinition {
        AlarmDefinition {
            id: "d1".to_string(),
            name: "cpu high".to_string(),
            description: String::new(),
            expression: expression.to_string(),
            match_by: match_by.iter().map(|s| s.to_string()).collect(),
            severity: Default::default(),
            alarm_actions: vec![],
            ok_actions: vec![],
            undetermined_actions: vec![],
            expression_data: vec![],
        }
    }

    #[test]
    fn valid_definition_needs_name_and_expression() {
        assert!(is_valid_definition(&def("max(cpu)>10", &[])));
        assert!(!is_valid_definition(&def("max(cpu>10", &[])));
        let mut unnamed = def("max(cpu)>10", &[]);
        unnamed.name = "  ".to_string();
        assert!(!is_valid_definition(&unnamed));
    }

    #[test]
    fn update_may_change_threshold_and_function() {
        let old = def("max(cpu{host=h1})>10 and min(mem)<5", &["host"]);
        let new = def("avg(cpu{host=h1})>=99 times 3 and min(mem)<1", &["host"]);
        assert!(is_valid_update(&old, &new));
    }

    #[test]
    fn update_must_keep_metric_identity() {
        let old = def("max(cpu)>10", &[]);
        assert!(!is_valid_update(&old, &def("max(memory)>10", &[])));
        assert!(!is_valid_update(&old, &def("max(cpu{host=h1})>10", &[])));
    }

    #[test]
    fn update_must_keep_sub_expression_count() {
        let old = def("max(cpu)>10", &[]);
        assert!(!is_valid_update(&old, &def("max(cpu)>10 and max(cpu)>20", &[])));
    }

    #[test]
    fn update_must_keep_match_by() {
        let old = def("max(cpu)>10", &["host"]);
        assert!(!is_valid_update(&old, &def("max(cpu)>10", &[])));
        assert!(!is_valid_update(&old, &def("max(cpu)>10", &["os"])));
        assert!(is_valid_update(&old, &def("max(cpu)>20", &["host"])));
    }
}
