//! Prompts for the explorer, drafter and scriptwriter roles.
//!
//! System prompts are constants; user messages are tera templates rendered
//! with [`render`] so every role receives the same instance fields.

use tera::{Context, Tera};

use crate::validation::{REPORT_END, REPORT_START};

/// Repository checkout location inside every image.
pub const REPO_DIR: &str = "/repo";

pub const EXPLORER_SYSTEM: &str = r#"You are a build engineer exploring a source repository to find out how to install it and run its tests.

The repository is checked out at the task's base commit in the current directory of a disposable container. You interact with it one action per reply. Each reply MUST be exactly one JSON object and nothing else:

{"action": "list", "path": "<relative directory>"}
{"action": "read", "path": "<relative file>"}
{"action": "run", "command": "<read-only shell command>"}
{"action": "finish", "finding": {
    "runtime_version": "<e.g. python 3.9, node 18, go 1.21>",
    "package_manager": "<e.g. pip, poetry, npm, maven, cargo>",
    "install_cmds": ["<commands to install dependencies and the project>"],
    "test_cmds": ["<commands that run the relevant tests with per-test output>"],
    "notes": "<anything the image or test script author must know>",
    "base_image": "<optional docker base image, e.g. python:3.9-slim>"
}}

Rules:
- Paths are relative to the repository root; never use absolute paths or "..".
- Commands must not modify the repository. Probes such as `python --version`, `cat setup.cfg`, `ls tests` or `grep -r pytest tox.ini` are fine.
- Command output is truncated to its first and last lines.
- Prefer the repository's own CI configuration, tox/nox files, Makefile and package manifests as evidence.
- test_cmds must be able to run individual test files and report one result per test.
- Finish as soon as you are confident; you have a limited number of turns."#;

pub const EXPLORER_USER: &str = r#"Repository: {{ repo }}
Base commit: {{ base_commit }}
Language: {{ language }}
{% if version %}Version: {{ version }}
{% endif %}
Problem statement:
{{ problem_statement }}

Files touched by the test patch:
{% if test_files %}{% for f in test_files %}- {{ f }}
{% endfor %}{% else %}- (none)
{% endif %}
{% if previous_finding %}
A previous exploration produced this finding:
```json
{{ previous_finding }}
```
{% endif %}{% if reason %}
The last validation round failed as `{{ classification }}`: {{ reason }}
{% if failure %}
Relevant logs:
```
{{ failure }}
```
{% endif %}Re-derive the finding; the earlier understanding of the build or test suite was likely wrong.
{% endif %}
Start exploring. Reply with one JSON action."#;

pub const DRAFTER_SYSTEM: &str = r#"You are a container engineer writing a Dockerfile that produces a ready-to-test checkout of a repository.

Requirements:
- The image is built with no build context: never use COPY or ADD of local files.
- Clone the repository from GitHub into /repo and check out the exact base commit.
- Install the runtime and every dependency needed to run the test suite, including test runners.
- Set WORKDIR /repo as the final working directory.
- Do not run the test suite during the build.
- Pin versions where the repository's era requires it; old commits often need old toolchains.

Reply with the complete Dockerfile in a single ```dockerfile fenced block."#;

pub const DRAFTER_USER: &str = r#"Repository: {{ repo }} (https://github.com/{{ repo }}.git)
Base commit: {{ base_commit }}
Language: {{ language }}
{% if version %}Version: {{ version }}
{% endif %}
Exploration finding:
```json
{{ finding }}
```
Suggested base image: {{ base_image }}
{% if seed %}
A Dockerfile that worked for a nearby version of this repository:
```dockerfile
{{ seed }}
```
Adapt it instead of starting from scratch.
{% endif %}{% if previous %}
Your previous Dockerfile:
```dockerfile
{{ previous }}
```
{% endif %}{% if reason %}
It failed validation ({{ classification }}): {{ reason }}
{% if failure %}
Build log:
```
{{ failure }}
```
{% endif %}Fix the cause. Returning the same Dockerfile again ends the attempt.
{% endif %}"#;

pub const SCRIPTWRITER_SYSTEM: &str = r#"You are a test engineer writing the body of a bash evaluation script.

The script runs inside the image built from the given Dockerfile. A fixed preamble, prepended for you, has already applied the patch under test and changed into /repo. Your body must:
- Run the test suite with the commands from the finding, covering at least the files touched by the test patch.
- Never exit early because tests fail; a failing test is a result, not an error.
- Print a report block at the end, exactly in this form:

{{REPORT_START}}
PASS	<test id>
FAIL	<test id>
{{REPORT_END}}

One line per test: the outcome (PASS, FAIL, ERROR or SKIP), a single TAB, then a stable test id such as `tests/test_api.py::TestClient::test_get`. Nothing else may appear between the markers. Convert the runner's own output (e.g. `pytest -rA`, `go test -v`, JUnit XML, `jest --json`) into these lines with grep/sed/awk or an inline python/node snippet.

Reply with the script body in a single ```bash fenced block. Do not include the preamble."#;

pub const SCRIPTWRITER_USER: &str = r#"Repository: {{ repo }}
Language: {{ language }}

Exploration finding:
```json
{{ finding }}
```

Dockerfile:
```dockerfile
{{ dockerfile }}
```

Files touched by the test patch:
{% if test_files %}{% for f in test_files %}- {{ f }}
{% endfor %}{% else %}- (none)
{% endif %}{% if previous %}
Your previous script body:
```bash
{{ previous }}
```
{% endif %}{% if reason %}
It failed validation ({{ classification }}): {{ reason }}
{% if failure %}
Run logs:
```
{{ failure }}
```
{% endif %}Fix the script so it runs the right tests and reports them in the required format.
{% endif %}"#;

/// Render a user template with the given context.
pub fn render(template: &str, context: &Context) -> Result<String, tera::Error> {
    Tera::one_off(template, context, false)
}

/// The scriptwriter system prompt with the report markers filled in.
pub fn scriptwriter_system() -> String {
    SCRIPTWRITER_SYSTEM
        .replace("{{REPORT_START}}", REPORT_START)
        .replace("{{REPORT_END}}", REPORT_END)
}

/// Fixed preamble of every eval script. `$1` is the patch file.
///
/// Patch application falls back from `git apply` to a three-way merge and
/// then to `patch --fuzz`; a patch that applies nowhere exits with 97 so it
/// shows up as a missing report rather than as test failures.
pub fn eval_preamble() -> String {
    format!(
        r#"#!/bin/bash
set -uo pipefail
PATCH_FILE="${{1:-}}"
cd {repo_dir}
if [ -n "$PATCH_FILE" ] && [ -s "$PATCH_FILE" ]; then
    if git apply --verbose "$PATCH_FILE" 2>/dev/null || \
       {{ git checkout -- . 2>/dev/null; git apply --verbose --3way "$PATCH_FILE"; }} || \
       {{ git checkout -- . 2>/dev/null; patch --batch --fuzz=5 -p1 -i "$PATCH_FILE"; }}; then
        echo ">>>>> Applied patch"
    else
        echo ">>>>> Patch apply failed" >&2
        exit 97
    fi
fi
"#,
        repo_dir = REPO_DIR
    )
}
