use std::collections::BTreeMap;

/// Passes over the variable set before giving up on nested references
pub const MAX_REFERENCE_PASSES: usize = 3;

/// Resolve single-brace references (`"Welcome to {app_name}"`) between variables.
///
/// A value never substitutes itself. Nested references resolve within
/// [`MAX_REFERENCE_PASSES`] passes; anything deeper stays as-is.
pub fn resolve_references(variables: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut resolved = variables.clone();
    let keys: Vec<String> = resolved.keys().cloned().collect();

    for _ in 0..MAX_REFERENCE_PASSES {
        let mut changed = false;

        for key in &keys {
            let Some(current) = resolved.get(key) else {
                continue;
            };
            if !current.contains('{') {
                continue;
            }

            let mut value = current.clone();
            for (other, replacement) in &resolved {
                if other != key {
                    value = value.replace(&format!("{{{other}}}"), replacement);
                }
            }

            if &value != current {
                resolved.insert(key.clone(), value);
                changed = true;
            }
        }

        if !changed {
            break;
        }
    }

    resolved
}
