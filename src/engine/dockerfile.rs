use crate::error::{DazzleError, Result};

/// The reduced instruction set the local engine replays
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    From(String),
    Arg(String),
    Workdir(String),
    /// (sources, destination)
    Copy(Vec<String>, String),
    Run(String),
    Env(Vec<(String, String)>),
    Cmd(Vec<String>),
    Label(Vec<(String, String)>),
    User(String),
    Other(String),
}

impl Instruction {
    pub fn keyword(&self) -> &'static str {
        match self {
            Instruction::From(_) => "FROM",
            Instruction::Arg(_) => "ARG",
            Instruction::Workdir(_) => "WORKDIR",
            Instruction::Copy(..) => "COPY",
            Instruction::Run(_) => "RUN",
            Instruction::Env(_) => "ENV",
            Instruction::Cmd(_) => "CMD",
            Instruction::Label(_) => "LABEL",
            Instruction::User(_) => "USER",
            Instruction::Other(_) => "OTHER",
        }
    }
}

/// Joins `\`-continued lines and drops comments and blank lines
fn logical_lines(content: &str) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();

    for raw in content.lines() {
        let line = raw.trim();
        // comments inside a continuation are skipped, not terminating
        if line.starts_with('#') {
            continue;
        }
        match line.strip_suffix('\\') {
            Some(head) => {
                current.push_str(head.trim_end());
                current.push(' ');
            }
            None => {
                current.push_str(line);
                let full = current.trim().to_string();
                if !full.is_empty() {
                    lines.push(full);
                }
                current.clear();
            }
        }
    }
    let rest = current.trim();
    if !rest.is_empty() {
        lines.push(rest.to_string());
    }
    lines
}

/// Splits on whitespace, honouring single quotes, double quotes and backslash escapes
pub fn split_words(input: &str) -> Result<Vec<String>> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match c {
            '"' | '\'' => {
                in_word = true;
                let quote = c;
                loop {
                    match chars.next() {
                        Some(q) if q == quote => break,
                        Some('\\') if quote == '"' => {
                            if let Some(escaped) = chars.next() {
                                current.push(escaped);
                            }
                        }
                        Some(other) => current.push(other),
                        None => {
                            return Err(DazzleError::configuration(
                                input,
                                "unterminated quote",
                            ))
                        }
                    }
                }
            }
            '\\' => {
                in_word = true;
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

/// `["a", "b"]` exec form, if `args` is one
fn exec_form(args: &str) -> Option<Vec<String>> {
    if args.starts_with('[') {
        serde_json::from_str::<Vec<String>>(args).ok()
    } else {
        None
    }
}

fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

/// `KEY=VALUE ...` pairs, or the legacy `KEY VALUE` form when `legacy` is set
fn key_values(keyword: &str, args: &str, legacy: bool) -> Result<Vec<(String, String)>> {
    let first = args.split_whitespace().next().unwrap_or_default();
    if legacy && !first.contains('=') {
        let value = args[first.len()..].trim();
        if first.is_empty() || value.is_empty() {
            return Err(DazzleError::configuration(keyword, format!("malformed: {}", args)));
        }
        return Ok(vec![(first.to_string(), value.to_string())]);
    }

    split_words(args)?
        .into_iter()
        .map(|word| match word.split_once('=') {
            Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
            _ => Err(DazzleError::configuration(
                keyword,
                format!("expected KEY=VALUE, got '{}'", word),
            )),
        })
        .collect()
}

pub fn parse_dockerfile(content: &str) -> Result<Vec<Instruction>> {
    let mut instructions = Vec::new();

    for line in logical_lines(content) {
        let word = line.split_whitespace().next().unwrap_or_default();
        let args = line[word.len()..].trim();
        let keyword = word.to_uppercase();
        let missing = || DazzleError::configuration(&keyword, "missing arguments");

        let instruction = match keyword.as_str() {
            "FROM" => {
                let image = args.split_whitespace().next().ok_or_else(missing)?;
                Instruction::From(image.to_string())
            }
            "ARG" => Instruction::Arg(args.to_string()),
            "WORKDIR" => {
                if args.is_empty() {
                    return Err(missing());
                }
                Instruction::Workdir(args.to_string())
            }
            "COPY" => {
                let mut words = match exec_form(args) {
                    Some(words) => words,
                    None => split_words(args)?,
                };
                // --chown and friends have no meaning without a user database
                words.retain(|w| !w.starts_with("--"));
                if words.len() < 2 {
                    return Err(DazzleError::configuration(
                        "COPY",
                        "needs at least one source and a destination",
                    ));
                }
                let dst = words.pop().ok_or_else(missing)?;
                Instruction::Copy(words, dst)
            }
            "RUN" => {
                if args.is_empty() {
                    return Err(missing());
                }
                match exec_form(args) {
                    Some(argv) => Instruction::Run(
                        argv.iter().map(|w| shell_quote(w)).collect::<Vec<_>>().join(" "),
                    ),
                    None => Instruction::Run(args.to_string()),
                }
            }
            "ENV" => Instruction::Env(key_values("ENV", args, true)?),
            "LABEL" => Instruction::Label(key_values("LABEL", args, false)?),
            "CMD" => match exec_form(args) {
                Some(argv) => Instruction::Cmd(argv),
                None => Instruction::Cmd(vec![
                    "/bin/sh".to_string(),
                    "-c".to_string(),
                    args.to_string(),
                ]),
            },
            "USER" => {
                if args.is_empty() {
                    return Err(missing());
                }
                Instruction::User(args.to_string())
            }
            _ => Instruction::Other(line.clone()),
        };
        instructions.push(instruction);
    }

    Ok(instructions)
}
