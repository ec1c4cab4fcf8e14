//! Redis command quantization.

const REDIS_COMPOUND_COMMANDS: &[&str] = &["CLIENT", "CLUSTER", "COMMAND", "CONFIG", "DEBUG", "SCRIPT"];
const REDIS_TRUNCATION_MARK: &str = "...";
const MAX_REDIS_NB_COMMANDS: usize = 3;

fn is_compound(command: &str) -> bool {
    REDIS_COMPOUND_COMMANDS.iter().any(|c| c.eq_ignore_ascii_case(command))
}

/// Splits a (possibly multi-line) command string into the whitespace-separated words of each non-blank line.
fn command_lines(query: &str) -> impl Iterator<Item = Vec<&str>> {
    query
        .lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>())
        .filter(|parts| !parts.is_empty())
}

/// Quantizes a Redis command string by extracting just the command names.
///
/// At most three commands are kept, followed by `...` when more were sent or when the last one was truncated by the
/// client.
pub fn quantize_redis_string(query: &str) -> String {
    let lines: Vec<_> = command_lines(query).collect();
    let mut resource = String::new();
    let mut truncated = false;
    let mut nb_cmds = 0;
    let mut consumed = 0;

    for parts in &lines {
        if nb_cmds == MAX_REDIS_NB_COMMANDS {
            break;
        }
        consumed += 1;

        if parts[0].ends_with(REDIS_TRUNCATION_MARK) {
            truncated = true;
            continue;
        }

        let mut command = parts[0].to_uppercase();
        if is_compound(&command) && parts.len() > 1 {
            if parts[1].ends_with(REDIS_TRUNCATION_MARK) {
                truncated = true;
                continue;
            }
            command.push(' ');
            command.push_str(&parts[1].to_uppercase());
        }

        if !resource.is_empty() {
            resource.push(' ');
        }
        resource.push_str(&command);

        nb_cmds += 1;
        truncated = false;
    }

    if (nb_cmds == MAX_REDIS_NB_COMMANDS && consumed < lines.len()) || truncated {
        if !resource.is_empty() {
            resource.push(' ');
        }
        resource.push_str(REDIS_TRUNCATION_MARK);
    }

    resource
}

/// Replaces the arguments of every command with a single `?`, keeping the sub-command of compound commands.
///
/// Quantizing the result gives the same resource as quantizing the input.
pub fn remove_redis_args(query: &str) -> String {
    command_lines(query)
        .map(|parts| {
            let keep = if is_compound(parts[0]) && parts.len() > 1 { 2 } else { 1 };
            let mut line = parts[..keep].join(" ");
            if parts.len() > keep {
                line.push_str(" ?");
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n")
}
