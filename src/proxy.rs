use crate::constants::EXCLUDED_GLOBAL_PARAMS;
use crate::task::SandboxTask;
use crate::vars::{EnvMap, VolumeMap};

/// Generic command re-invoking a task, plus everything a backend needs to
/// wrap it: exported variables, mounts, setup commands and the user to run as.
#[derive(Debug, Clone, Default)]
pub struct ProxyCommand {
    pub executable: Vec<String>,
    pub task_family: String,
    pub task_args: Vec<(String, String)>,
    pub global_args: Vec<(String, String)>,
    pub env: EnvMap,
    pub volumes: VolumeMap,
    pub setup_cmds: Vec<String>,
    pub user: Option<(u32, u32)>,
}

impl ProxyCommand {
    /// Command for `task`, dropping sandbox-only task parameters and worker-pool global parameters
    pub fn for_task(task: &dyn SandboxTask, executable: Vec<String>) -> Self {
        let excluded = task.excluded_sandbox_params();
        let task_args = task
            .params()
            .into_iter()
            .filter(|(name, _)| !excluded.iter().any(|e| e == name))
            .collect();
        let global_args = task
            .global_params()
            .into_iter()
            .filter(|(name, _)| !EXCLUDED_GLOBAL_PARAMS.contains(&name.as_str()))
            .collect();

        Self {
            executable,
            task_family: task.family(),
            task_args,
            global_args,
            ..Default::default()
        }
    }

    /// Argument vector: executable, `run`, family, then `--name value` pairs
    pub fn args(&self) -> Vec<String> {
        let mut args = self.executable.clone();
        args.push("run".to_string());
        args.push(self.task_family.clone());
        for (name, value) in self.task_args.iter().chain(self.global_args.iter()) {
            args.push(format!("--{}", name.replace('_', "-")));
            args.push(value.clone());
        }
        args
    }

    /// Arguments joined into a single shell-safe string
    pub fn to_shell(&self) -> String {
        self.args()
            .iter()
            .map(|a| shell_quote(a))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// `export NAME="value"` lines for every variable; `$` is left for the shell to expand
    pub fn export_cmds(&self) -> Vec<String> {
        self.env
            .iter()
            .map(|(k, v)| format!("export {}=\"{}\"", k, escape_double_quoted(v)))
            .collect()
    }
}

/// Quote a word for POSIX shells unless it only holds safe characters
pub fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+,".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

/// Split a command line into words the way a POSIX shell would, honouring
/// single quotes, double quotes and backslash escapes. No expansion happens.
pub fn split_words(line: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut word = String::new();
    let mut in_word = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                word.extend(chars.by_ref().take_while(|&c| c != '\''));
            }
            '"' => {
                in_word = true;
                while let Some(c) = chars.next() {
                    match c {
                        '"' => break,
                        '\\' => match chars.next() {
                            Some(next @ ('"' | '\\' | '$' | '`')) => word.push(next),
                            Some(next) => {
                                word.push('\\');
                                word.push(next);
                            }
                            None => word.push('\\'),
                        },
                        _ => word.push(c),
                    }
                }
            }
            '\\' => {
                in_word = true;
                if let Some(next) = chars.next() {
                    word.push(next);
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut word));
                    in_word = false;
                }
            }
            _ => {
                in_word = true;
                word.push(c);
            }
        }
    }
    if in_word {
        words.push(word);
    }
    words
}

fn escape_double_quoted(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '"' | '`' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain-word_1.txt"), "plain-word_1.txt");
        assert_eq!(shell_quote("two words"), "'two words'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_args_and_exports() {
        let mut cmd = ProxyCommand {
            executable: vec!["sandtask".to_string()],
            task_family: "ProcessData".to_string(),
            task_args: vec![("dataset_name".to_string(), "run 2".to_string())],
            global_args: vec![("log_level".to_string(), "INFO".to_string())],
            ..Default::default()
        };
        cmd.env.insert("SANDTASK_SANDBOX", "bash::$HOME/env.sh");
        cmd.env.insert("WINDIR", r"C:\dir\");
        cmd.env.insert("MSG", "say \"hi\"");

        assert_eq!(
            cmd.to_shell(),
            "sandtask run ProcessData --dataset-name 'run 2' --log-level INFO"
        );
        assert_eq!(
            cmd.export_cmds(),
            vec![
                r#"export SANDTASK_SANDBOX="bash::$HOME/env.sh""#.to_string(),
                r#"export WINDIR="C:\\dir\\""#.to_string(),
                r#"export MSG="say \"hi\"""#.to_string(),
            ]
        );
    }

    #[test]
    fn test_split_words_honours_quotes() {
        assert_eq!(
            split_words("  '/opt/my tools/run' --flag  "),
            vec!["/opt/my tools/run", "--flag"]
        );
        assert_eq!(
            split_words(r#"python -c "print(\"a b\")" x\ y ''"#),
            vec!["python", "-c", r#"print("a b")"#, "x y", ""]
        );
        assert_eq!(split_words("sandtask run"), vec!["sandtask", "run"]);
        assert!(split_words("   ").is_empty());
    }
}
