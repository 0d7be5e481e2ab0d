use crate::constants::env;
use crate::descriptor::JobDescriptor;

use std::fmt::Write;
use std::path::Path;

/// Quotes a word for a POSIX shell.
pub fn shell_quote(word: &str) -> String {
    if !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c))
    {
        return word.to_string();
    }
    format!("'{}'", word.replace('\'', r#"'\''"#))
}

fn quote_path(path: &Path) -> String {
    shell_quote(&path.to_string_lossy())
}

/// Renders a complete bash job script: the backend's directive lines followed by
/// the shared body that runs the target program and writes the completion marker.
pub fn render_script(directives: &[String], descriptor: &JobDescriptor) -> String {
    let mut script = String::from("#!/bin/bash\n");
    for line in directives {
        script.push_str(line);
        script.push('\n');
    }
    script.push('\n');
    script.push_str(&render_body(descriptor));
    script
}

pub fn render_body(descriptor: &JobDescriptor) -> String {
    let mut body = String::new();

    // writing to a String cannot fail
    let _ = writeln!(body, "cd {} || exit 1", quote_path(&descriptor.workdir));
    let _ = writeln!(
        body,
        "export {}={}",
        env::OUTPUT_DIR,
        quote_path(&descriptor.workdir)
    );
    let _ = writeln!(
        body,
        "export {}={}",
        env::COMPLETION_MARKER,
        quote_path(&descriptor.marker)
    );
    let _ = writeln!(body, "export {}={}", env::ORDINAL, descriptor.ordinal);
    for (key, value) in &descriptor.env {
        let _ = writeln!(body, "export {key}={}", shell_quote(value));
    }

    let command = descriptor
        .argv
        .iter()
        .map(|arg| shell_quote(arg))
        .collect::<Vec<_>>()
        .join(" ");
    let _ = writeln!(body, "\n{command}");
    let marker = env::COMPLETION_MARKER;
    let _ = write!(
        body,
        r#"ec=$?
if [ "$ec" -ne 0 ] || [ ! -f "${marker}" ]; then
    printf '{{"exit_code": %d}}\n' "$ec" > "${marker}.tmp" && mv -f "${marker}.tmp" "${marker}"
fi
exit $ec
"#
    );
    body
}
