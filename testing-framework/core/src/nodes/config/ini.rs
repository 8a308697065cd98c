//! Line-preserving edits of the node's INI-style `tahoe.cfg`.

/// `[name]`, optionally followed by a `#` or `;` comment.
fn section_name(line: &str) -> Option<&str> {
    let rest = line.trim().strip_prefix('[')?;
    let (name, trailer) = rest.split_once(']')?;
    let trailer = trailer.trim_start();
    (trailer.is_empty() || trailer.starts_with(['#', ';'])).then(|| name.trim())
}

fn is_comment(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with('#') || trimmed.starts_with(';')
}

fn entry(line: &str) -> Option<(&str, &str)> {
    if is_comment(line) || section_name(line).is_some() {
        return None;
    }
    line.split_once('=')
        .map(|(key, value)| (key.trim(), value.trim()))
}

/// Value of `key` in `[section]`, if present.
pub(crate) fn get_value(contents: &str, section: &str, key: &str) -> Option<String> {
    let mut current: Option<&str> = None;
    for line in contents.lines() {
        if let Some(name) = section_name(line) {
            current = Some(name);
            continue;
        }
        if current != Some(section) {
            continue;
        }
        if let Some((k, v)) = entry(line)
            && k == key
        {
            return Some(v.to_owned());
        }
    }
    None
}

/// Return `contents` with `key = value` set in `[section]`. Other lines keep
/// their text and order; a missing key is appended to the end of its section
/// and a missing section to the end of the file.
pub(crate) fn set_value(contents: &str, section: &str, key: &str, value: &str) -> String {
    let mut lines: Vec<String> = contents.lines().map(str::to_owned).collect();
    let rendered = format!("{key} = {value}");

    let mut current: Option<&str> = None;
    let mut header: Option<usize> = None;
    let mut section_end: Option<usize> = None;
    let mut existing: Option<usize> = None;
    for (idx, line) in lines.iter().enumerate() {
        if let Some(name) = section_name(line) {
            current = Some(name);
            if name == section && header.is_none() {
                header = Some(idx);
            }
            continue;
        }
        if current != Some(section) {
            continue;
        }
        if let Some((k, _)) = entry(line)
            && k == key
        {
            existing = Some(idx);
            break;
        }
        if !line.trim().is_empty() {
            section_end = Some(idx);
        }
    }

    match (existing, header, section_end) {
        (Some(idx), _, _) => lines[idx] = rendered,
        (None, Some(_), Some(last)) => lines.insert(last + 1, rendered),
        (None, Some(header), None) => lines.insert(header + 1, rendered),
        (None, None, _) => {
            if lines.last().is_some_and(|line| !line.trim().is_empty()) {
                lines.push(String::new());
            }
            lines.push(format!("[{section}]"));
            lines.push(rendered);
        }
    }
    join(lines)
}

fn join(lines: Vec<String>) -> String {
    let mut out = lines.join("\n");
    out.push('\n');
    out
}
