//! Environment assembly for `run` actions.
//!
//! Variables are applied in order and each value may reference anything
//! defined before it, including earlier definitions of itself:
//! `FOO=BAR`, `BAZ=WIBBLE`, `FOO=$FOO-$BAZ` leaves `FOO=BAR-WIBBLE`.

use cellgrid_state::EnvVar;

/// Expand `vars` on top of `base`, later definitions replacing earlier ones.
pub fn expand_env(base: &[(String, String)], vars: &[EnvVar]) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = base.to_vec();
    for var in vars {
        let value = expand(&var.value, |name| {
            env.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
        });
        match env.iter_mut().find(|(k, _)| *k == var.name) {
            Some(slot) => slot.1 = value,
            None => env.push((var.name.clone(), value)),
        }
    }
    env
}

/// Substitute `$NAME` and `${NAME}`. Unknown names expand to nothing and a
/// `$` not followed by a name is kept literally.
pub fn expand<'a>(input: &str, lookup: impl Fn(&str) -> Option<&'a str>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        if let Some(braced) = after.strip_prefix('{')
            && let Some(end) = braced.find('}')
        {
            out.push_str(lookup(&braced[..end]).unwrap_or(""));
            rest = &braced[end + 1..];
            continue;
        }

        let len = after
            .char_indices()
            .find(|&(i, c)| !(c == '_' || c.is_ascii_alphabetic() || (i > 0 && c.is_ascii_digit())))
            .map(|(i, _)| i)
            .unwrap_or(after.len());
        if len == 0 {
            out.push('$');
            rest = after;
        } else {
            out.push_str(lookup(&after[..len]).unwrap_or(""));
            rest = &after[len..];
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get<'a>(env: &'a [(String, String)], name: &str) -> Option<&'a str> {
        env.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }

    #[test]
    fn later_values_see_earlier_ones() {
        let env = expand_env(
            &[],
            &[
                EnvVar::new("FOO", "BAR"),
                EnvVar::new("BAZ", "WIBBLE"),
                EnvVar::new("FOO", "$FOO-$BAZ"),
            ],
        );
        assert_eq!(get(&env, "FOO"), Some("BAR-WIBBLE"));
        assert_eq!(get(&env, "BAZ"), Some("WIBBLE"));
        assert_eq!(env.len(), 2);
    }

    #[test]
    fn base_is_visible() {
        let base = vec![("HOME".to_string(), "/sandbox".to_string())];
        let env = expand_env(&base, &[EnvVar::new("CACHE", "${HOME}/cache")]);
        assert_eq!(get(&env, "CACHE"), Some("/sandbox/cache"));
    }

    #[test]
    fn unknown_and_literal_dollars() {
        let none = |_: &str| None;
        assert_eq!(expand("a$MISSING-b", none), "a-b");
        assert_eq!(expand("cost: $5", none), "cost: $5");
        assert_eq!(expand("trailing $", none), "trailing $");
        assert_eq!(expand("${unterminated", none), "${unterminated");
    }
}
