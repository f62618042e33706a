//! Verification command detection from a project manifest.

use std::collections::BTreeMap;

use serde_json::Value;

const TYPECHECK_SCRIPTS: [&str; 2] = ["typecheck", "type-check"];
const TEST_SCRIPT: &str = "test";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandRole {
    TypeCheck,
    Test,
    Custom,
}

/// A command the verification pipeline will run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedCommand {
    pub role: CommandRole,
    pub program: String,
    pub args: Vec<String>,
}

impl DetectedCommand {
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Extract the `scripts` table from a parsed `package.json`.
pub fn manifest_scripts(manifest: &Value) -> BTreeMap<String, String> {
    manifest
        .get("scripts")
        .and_then(Value::as_object)
        .map(|scripts| {
            scripts
                .iter()
                .filter_map(|(name, body)| Some((name.clone(), body.as_str()?.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

/// Detect the type-check and test commands, in that order.
///
/// Falls back to a direct `tsc --noEmit` when `has_tsconfig` is set and no
/// type-check script exists. Known watch-mode test runners get a run-once flag.
pub fn detect_commands(
    scripts: &BTreeMap<String, String>,
    has_tsconfig: bool,
    package_manager: &str,
) -> Vec<DetectedCommand> {
    let mut commands = Vec::new();

    match TYPECHECK_SCRIPTS
        .iter()
        .find(|name| scripts.contains_key(**name))
    {
        Some(name) => commands.push(run_script(package_manager, name, None)),
        None if has_tsconfig => {
            let mut exec = exec_prefix(package_manager);
            let program = exec.remove(0);
            exec.extend(["tsc".to_string(), "--noEmit".to_string()]);
            commands.push(DetectedCommand {
                role: CommandRole::TypeCheck,
                program,
                args: exec,
            });
        }
        None => {}
    }

    if let Some(body) = scripts.get(TEST_SCRIPT) {
        let flag = run_once_flag(body);
        let mut cmd = run_script(package_manager, TEST_SCRIPT, flag);
        cmd.role = CommandRole::Test;
        commands.push(cmd);
    }

    commands
}

/// Build commands from explicit argv lists, skipping empty entries.
pub fn explicit_commands(argvs: &[Vec<String>]) -> Vec<DetectedCommand> {
    argvs
        .iter()
        .filter_map(|argv| {
            let (program, args) = argv.split_first()?;
            if program.trim().is_empty() {
                return None;
            }
            Some(DetectedCommand {
                role: CommandRole::Custom,
                program: program.clone(),
                args: args.to_vec(),
            })
        })
        .collect()
}

fn run_script(package_manager: &str, script: &str, extra: Option<&str>) -> DetectedCommand {
    let mut args = vec!["run".to_string(), script.to_string()];
    if let Some(flag) = extra {
        if package_manager == "npm" {
            args.push("--".to_string());
        }
        args.push(flag.to_string());
    }
    DetectedCommand {
        role: CommandRole::TypeCheck,
        program: package_manager.to_string(),
        args,
    }
}

fn exec_prefix(package_manager: &str) -> Vec<String> {
    let prefix: &[&str] = match package_manager {
        "pnpm" => &["pnpm", "exec"],
        "yarn" => &["yarn"],
        "bun" => &["bunx"],
        _ => &["npx"],
    };
    prefix.iter().map(|s| s.to_string()).collect()
}

/// Flag that stops a known test runner from entering watch mode.
fn run_once_flag(script_body: &str) -> Option<&'static str> {
    let body = script_body.to_lowercase();
    if body.contains("vitest") {
        let already_once = body.contains("vitest run") || body.contains("--run");
        return (!already_once).then_some("--run");
    }
    if body.contains("jest") || body.contains("react-scripts test") {
        return (!body.contains("--watchall")).then_some("--watchAll=false");
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scripts(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn detects_typecheck_then_test_with_run_once_flag() {
        let detected = detect_commands(
            &scripts(&[("type-check", "tsc --noEmit"), ("test", "vitest")]),
            true,
            "npm",
        );
        let shown: Vec<String> = detected.iter().map(DetectedCommand::display).collect();
        assert_eq!(shown, vec!["npm run type-check", "npm run test -- --run"]);
        assert_eq!(detected[0].role, CommandRole::TypeCheck);
        assert_eq!(detected[1].role, CommandRole::Test);
    }

    #[test]
    fn falls_back_to_tsc_when_tsconfig_exists() {
        let detected = detect_commands(&scripts(&[("test", "jest")]), true, "pnpm");
        let shown: Vec<String> = detected.iter().map(DetectedCommand::display).collect();
        assert_eq!(
            shown,
            vec!["pnpm exec tsc --noEmit", "pnpm run test --watchAll=false"]
        );
    }

    #[test]
    fn no_scripts_and_no_tsconfig_detects_nothing() {
        assert!(detect_commands(&BTreeMap::new(), false, "npm").is_empty());
    }

    #[test]
    fn vitest_run_is_left_alone() {
        let detected = detect_commands(&scripts(&[("test", "vitest run")]), false, "npm");
        assert_eq!(detected[0].display(), "npm run test");
    }

    #[test]
    fn reads_scripts_from_manifest() {
        let manifest = json!({"name": "app", "scripts": {"test": "mocha", "weird": 3}});
        assert_eq!(manifest_scripts(&manifest), scripts(&[("test", "mocha")]));
        assert!(manifest_scripts(&json!({})).is_empty());
    }

    #[test]
    fn explicit_commands_skip_empty_argv() {
        let cmds = explicit_commands(&[
            vec!["cargo".to_string(), "test".to_string()],
            Vec::new(),
        ]);
        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0].display(), "cargo test");
    }
}
