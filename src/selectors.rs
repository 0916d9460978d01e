//! Pure predicates over node annotations and labels.
//!
//! These implement the selector half of the reboot protocol: given a `Node`,
//! decide which lifecycle state its annotation/label set describes. No I/O;
//! absent maps are treated as empty, and boolean annotations only count when
//! they equal the literal string "true" (or "false" where noted).

use k8s_openapi::api::core::v1::Node;

use crate::constants;

fn annotation<'a>(node: &'a Node, key: &str) -> Option<&'a str> {
    node.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
}

fn annotation_is(node: &Node, key: &str, value: &str) -> bool {
    annotation(node, key) == Some(value)
}

/// Whether `label` is set to "true" on the node.
pub fn has_label(node: &Node, label: &str) -> bool {
    node.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(label))
        .map(String::as_str)
        == Some(constants::TRUE)
}

/// Inverse of [`has_label`].
pub fn lacks_label(node: &Node, label: &str) -> bool {
    !has_label(node, label)
}

/// The node wants to reboot and is eligible for coordination: the agent has
/// asked for a reboot, no authorization has been granted yet, no reboot is
/// underway, and no operator has paused it.
pub fn rebootable(node: &Node) -> bool {
    annotation_is(node, constants::ANNOTATION_REBOOT_NEEDED, constants::TRUE)
        && !annotation_is(node, constants::ANNOTATION_REBOOT_PAUSED, constants::TRUE)
        && !annotation_is(node, constants::ANNOTATION_OK_TO_REBOOT, constants::TRUE)
        && !annotation_is(node, constants::ANNOTATION_REBOOT_IN_PROGRESS, constants::TRUE)
}

/// The node has completed a reboot: authorization is still in place but the
/// agent has reported both reboot-needed and reboot-in-progress back to
/// "false". Both must be the literal string; an agent that never ran does not
/// look just-rebooted.
pub fn just_rebooted(node: &Node) -> bool {
    annotation_is(node, constants::ANNOTATION_OK_TO_REBOOT, constants::TRUE)
        && annotation_is(node, constants::ANNOTATION_REBOOT_NEEDED, constants::FALSE)
        && annotation_is(node, constants::ANNOTATION_REBOOT_IN_PROGRESS, constants::FALSE)
}

/// The node holds an authorization it has not finished acting on.
pub fn still_rebooting(node: &Node) -> bool {
    annotation_is(node, constants::ANNOTATION_OK_TO_REBOOT, constants::TRUE)
        && annotation_is(node, constants::ANNOTATION_REBOOT_NEEDED, constants::TRUE)
}

/// Whether every annotation named in `names` is present on the node with the
/// literal value "true". An empty set is trivially satisfied.
pub fn has_all_annotations(node: &Node, names: &[String]) -> bool {
    names
        .iter()
        .all(|name| annotation_is(node, name, constants::TRUE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn node(annotations: &[(&str, &str)], labels: &[(&str, &str)]) -> Node {
        let to_map = |pairs: &[(&str, &str)]| -> Option<BTreeMap<String, String>> {
            Some(
                pairs
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            )
        };
        Node {
            metadata: ObjectMeta {
                name: Some("test-node".to_string()),
                annotations: to_map(annotations),
                labels: to_map(labels),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn rebootable_requires_reboot_needed() {
        assert!(rebootable(&node(
            &[(constants::ANNOTATION_REBOOT_NEEDED, "true")],
            &[]
        )));
        assert!(!rebootable(&node(&[], &[])));
        assert!(!rebootable(&node(
            &[(constants::ANNOTATION_REBOOT_NEEDED, "false")],
            &[]
        )));
        // Only the literal lowercase string counts.
        assert!(!rebootable(&node(
            &[(constants::ANNOTATION_REBOOT_NEEDED, "True")],
            &[]
        )));
    }

    #[test]
    fn rebootable_excludes_paused_and_in_flight_nodes() {
        assert!(!rebootable(&node(
            &[
                (constants::ANNOTATION_REBOOT_NEEDED, "true"),
                (constants::ANNOTATION_REBOOT_PAUSED, "true"),
            ],
            &[]
        )));
        assert!(!rebootable(&node(
            &[
                (constants::ANNOTATION_REBOOT_NEEDED, "true"),
                (constants::ANNOTATION_OK_TO_REBOOT, "true"),
            ],
            &[]
        )));
        assert!(!rebootable(&node(
            &[
                (constants::ANNOTATION_REBOOT_NEEDED, "true"),
                (constants::ANNOTATION_REBOOT_IN_PROGRESS, "true"),
            ],
            &[]
        )));
        // An explicit "false" pause does not exclude.
        assert!(rebootable(&node(
            &[
                (constants::ANNOTATION_REBOOT_NEEDED, "true"),
                (constants::ANNOTATION_REBOOT_PAUSED, "false"),
            ],
            &[]
        )));
    }

    #[test]
    fn just_rebooted_requires_explicit_false_values() {
        assert!(just_rebooted(&node(
            &[
                (constants::ANNOTATION_OK_TO_REBOOT, "true"),
                (constants::ANNOTATION_REBOOT_NEEDED, "false"),
                (constants::ANNOTATION_REBOOT_IN_PROGRESS, "false"),
            ],
            &[]
        )));
        // Absent annotations mean the agent never reported back.
        assert!(!just_rebooted(&node(
            &[(constants::ANNOTATION_OK_TO_REBOOT, "true")],
            &[]
        )));
        assert!(!just_rebooted(&node(
            &[
                (constants::ANNOTATION_OK_TO_REBOOT, "true"),
                (constants::ANNOTATION_REBOOT_NEEDED, "false"),
                (constants::ANNOTATION_REBOOT_IN_PROGRESS, "true"),
            ],
            &[]
        )));
    }

    #[test]
    fn still_rebooting_holds_while_authorization_is_unconsumed() {
        let n = node(
            &[
                (constants::ANNOTATION_OK_TO_REBOOT, "true"),
                (constants::ANNOTATION_REBOOT_NEEDED, "true"),
            ],
            &[],
        );
        assert!(still_rebooting(&n));
        assert!(!rebootable(&n));
        assert!(!just_rebooted(&n));
    }

    #[test]
    fn label_predicates_match_true_only() {
        assert!(has_label(
            &node(&[], &[(constants::LABEL_BEFORE_REBOOT, "true")]),
            constants::LABEL_BEFORE_REBOOT
        ));
        assert!(!has_label(
            &node(&[], &[(constants::LABEL_BEFORE_REBOOT, "false")]),
            constants::LABEL_BEFORE_REBOOT
        ));
        assert!(lacks_label(&node(&[], &[]), constants::LABEL_BEFORE_REBOOT));
    }

    #[test]
    fn hook_annotation_check() {
        let hooks = vec![
            "example.com/ready".to_string(),
            "example.com/drained".to_string(),
        ];
        assert!(has_all_annotations(
            &node(
                &[
                    ("example.com/ready", "true"),
                    ("example.com/drained", "true"),
                ],
                &[]
            ),
            &hooks
        ));
        assert!(!has_all_annotations(
            &node(
                &[
                    ("example.com/ready", "true"),
                    ("example.com/drained", "false"),
                ],
                &[]
            ),
            &hooks
        ));
        assert!(!has_all_annotations(
            &node(&[("example.com/ready", "true")], &[]),
            &hooks
        ));
        // Empty hook set is trivially satisfied.
        assert!(has_all_annotations(&node(&[], &[]), &[]));
    }
}
