//! Best-effort test script hardening.
//!
//! Replaces known-dangerous patterns (process control, raw filesystem or
//! child-process module access, dynamic code evaluation) with an inert
//! marker before the script reaches the sandbox.
//!
//! This is input hardening, NOT a security boundary: the runner process
//! still executes arbitrary JavaScript and must be sandboxed at the
//! filesystem/OS level.

use std::sync::OnceLock;

use regex::Regex;

const BLOCKED: &str = "/* blocked */";

fn deny_patterns() -> &'static Vec<Regex> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            // child_process: spawn/exec/fork access
            r#"require\s*\(\s*['"]child_process['"]\s*\)"#,
            r#"from\s+['"]child_process['"]"#,
            r#"import\s*\(\s*['"]child_process['"]\s*\)"#,
            // raw filesystem module
            r#"require\s*\(\s*['"]fs(/promises)?['"]\s*\)"#,
            r#"from\s+['"]fs(/promises)?['"]"#,
            r#"import\s*\(\s*['"]fs(/promises)?['"]\s*\)"#,
            // process control and environment
            r"process\s*\.\s*(exit|kill|abort|env)\b",
            // dynamic code evaluation
            r"\beval\s*\(",
            r"new\s+Function\s*\(",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("invalid deny pattern"))
        .collect()
    })
}

/// Replace each dangerous pattern match with an inert marker.
/// Returns the sanitized script and the number of replacements made.
pub fn sanitize_script(script: &str) -> (String, usize) {
    let mut out = script.to_string();
    let mut hits = 0;
    for re in deny_patterns() {
        let count = re.find_iter(&out).count();
        if count > 0 {
            hits += count;
            out = re.replace_all(&out, BLOCKED).into_owned();
        }
    }
    (out, hits)
}
