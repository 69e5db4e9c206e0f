//! Integration tests for the policy layer.
//!
//! These tests drive the public API the way a host does:
//! - select a policy by name and run programs against caller bindings
//! - inspect the bindings and classified failures afterwards
//! - check what mediated programs can and cannot observe

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use sluice::{
    Bindings, ClassifiedFailure, DEFAULT_ENV_ALLOWLIST, ExecError, Namespace, Policy,
    RestrictivePolicy, SkillRunner, Value, get_policy,
};

fn restrictive() -> Policy {
    get_policy(Some("restrictive"), &tracing::Span::none())
}

fn failure(policy: &Policy, code: &str, bindings: &mut Bindings) -> ClassifiedFailure {
    let err = policy.exec(code, bindings).expect_err("program should fail");
    ClassifiedFailure::from(&err)
}

#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl io::Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().expect("log buffer").extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn with_logs<T>(level: tracing::Level, f: impl FnOnce() -> T) -> (T, String) {
    let captured = Captured::default();
    let writer = captured.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .without_time()
        .with_max_level(level)
        .finish();
    let result = tracing::subscriber::with_default(subscriber, f);
    let text = String::from_utf8(captured.0.lock().expect("log buffer").clone()).expect("utf-8 logs");
    (result, text)
}

// =============================================================================
// Scenarios
// =============================================================================

mod scenarios {
    use super::*;

    #[test]
    fn test_division_by_zero_is_classified_with_line() {
        let f = failure(&restrictive(), "result = 1/0", &mut Bindings::new());
        assert_eq!(f.kind, "ZeroDivisionError");
        assert_eq!(f.line_start, 1);
    }

    #[test]
    fn test_denied_import_names_the_module() {
        let mut policy = RestrictivePolicy::new();
        policy.deny_module("socket");
        let f = failure(&policy.into(), "import socket", &mut Bindings::new());
        assert_eq!(f.kind, "PermissionError");
        assert!(f.description.contains("socket"), "{}", f.description);
    }

    #[test]
    fn test_private_attribute_rejected_for_program_but_not_host() {
        let mut bindings = Bindings::new();
        bindings.insert("x", Namespace::new("client"));

        let f = failure(&restrictive(), "x.__secret = 1", &mut bindings);
        assert_eq!(f.kind, "PermissionError");
        assert_eq!(f.description, "Cannot access \"__secret\" because it starts with \"_\"");
        let Some(Value::Namespace(x)) = bindings.get("x") else {
            panic!("x should stay a namespace");
        };
        assert!(x.get("__secret").is_none());

        let mut x = x.clone();
        x.set("__secret", Value::Int(1));
        assert_eq!(x.get("__secret").and_then(Value::as_int), Some(1));

        bindings.insert("x", x);
        restrictive()
            .exec("found = hasattr(x, '__secret')\n", &mut bindings)
            .expect("hasattr never raises for private names");
        assert_eq!(bindings.get("found"), Some(&Value::Bool(false)));
    }

    #[test]
    fn test_missing_reply_is_no_response() {
        let runner = SkillRunner::new(restrictive());
        let response = runner.run("total = 1 + 2\n", &serde_json::Value::Null);
        assert!(!response.success);
        assert_eq!(response.errors[0].kind, "NoResponseError");
        assert_eq!((response.errors[0].line_start, response.errors[0].span_start), (0, 0));
    }

    #[test]
    fn test_unterminated_string_has_no_effects() {
        let mut bindings = Bindings::new();
        bindings.insert("counter", Value::Int(0));
        let f = failure(&restrictive(), "counter = 1\nname = 'abc\n", &mut bindings);
        assert_eq!(f.kind, "SyntaxError");
        assert_eq!(f.line_start, 2);
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings.get("counter").and_then(Value::as_int), Some(0));
    }

    #[test]
    fn test_malformed_program_calls_nothing() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let hook = Value::function("hook", move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Value::None)
        });
        for policy in [restrictive(), get_policy(Some("none"), &tracing::Span::none())] {
            let mut bindings = Bindings::new();
            bindings.insert("hook", hook.clone());
            let f = failure(&policy, "hook()\nx = 'abc", &mut bindings);
            assert_eq!(f.kind, "SyntaxError");
            assert_eq!(calls.load(Ordering::SeqCst), 0, "{}", policy.name());
            assert_eq!(bindings.len(), 1);
            assert_eq!(bindings.get("hook"), Some(&hook));
        }

        let mut bindings = Bindings::new();
        bindings.insert("hook", hook);
        restrictive().exec("hook()\n", &mut bindings).expect("well-formed call");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_ordinary_python_runs_unchanged() {
        let code = concat!(
            "import math\n",
            "big = 2 ** 100\n",
            "digits = len(str(math.factorial(1000)))\n",
            "shifted = (1 << 100) >> 98\n",
            "merged = sorted({1, 2} | {3})\n",
            "first, *rest = [*range(3)]\n",
            "n = 0\n",
            "while n < 3:\n",
            "    n += 1\n",
            "else:\n",
            "    done = True\n",
            "class Money:\n",
            "    def __init__(self, cents):\n",
            "        self.cents = cents\n",
            "    def __eq__(self, other):\n",
            "        return self.cents == other.cents\n",
            "    def __len__(self):\n",
            "        return self.cents\n",
            "    def __enter__(self):\n",
            "        return self\n",
            "    def __exit__(self, *exc):\n",
            "        return False\n",
            "same = Money(5) == Money(5)\n",
            "size = len(Money(7))\n",
            "with Money(1) as m:\n",
            "    inside = m.cents\n",
            "xs = [0, 0, 0]\n",
            "xs[1:] = [4, 5]\n",
        );
        let mut bindings = Bindings::new();
        restrictive().exec(code, &mut bindings).expect("ordinary code runs");
        assert!(matches!(bindings.get("big"), Some(Value::Opaque(o)) if o.repr == (1u128 << 100).to_string()));
        assert_eq!(bindings.get("digits").and_then(Value::as_int), Some(2568));
        assert_eq!(bindings.get("shifted").and_then(Value::as_int), Some(4));
        assert_eq!(bindings.get("merged").map(Value::repr).as_deref(), Some("[1, 2, 3]"));
        assert_eq!(bindings.get("rest").map(Value::repr).as_deref(), Some("[1, 2]"));
        assert_eq!(bindings.get("done"), Some(&Value::Bool(true)));
        assert_eq!(bindings.get("same"), Some(&Value::Bool(true)));
        assert_eq!(bindings.get("size").and_then(Value::as_int), Some(7));
        assert_eq!(bindings.get("inside").and_then(Value::as_int), Some(1));
        assert_eq!(bindings.get("xs").map(Value::repr).as_deref(), Some("[0, 4, 5]"));
    }

    #[test]
    fn test_deep_recursion_on_an_ordinary_thread() {
        let code = "def f(n):\n    return f(n + 1)\nf(0)\n";
        for policy in [restrictive(), get_policy(Some("none"), &tracing::Span::none())] {
            let f = failure(&policy, code, &mut Bindings::new());
            assert_eq!(f.kind, "RecursionError", "{}", policy.name());
        }
    }
}

// =============================================================================
// Resource limits
// =============================================================================

mod limits {
    use super::*;

    #[test]
    fn test_huge_widths_and_repeats_are_overflow_errors() {
        for code in [
            "s = f'{1:>9999999999999}'",
            "s = 'abc'.zfill(9223372036854775807)",
            "s = 'x'.center(10 ** 12)",
            "s = '{:>99999999999}'.format(1)",
            "s = format(1, '>99999999999')",
            "s = '%99999999999d' % 1",
            "s = 'a' * 10 ** 12",
            "s = [0] * 10 ** 12",
            "s = 'a'\ns *= 10 ** 12",
            "s = ['a']\ns[0] *= 10 ** 12",
            "s = {'k': [0]}\ns['k'] *= 10 ** 12",
            "class Box:\n    pass\no = Box()\no.x = 'a'\no.x *= 10 ** 12",
            "s = ['%5d']\ns[0] %= 1\ns[0] = '%99999999999d'\ns[0] %= 1",
        ] {
            let f = failure(&restrictive(), code, &mut Bindings::new());
            assert_eq!(f.kind, "OverflowError", "{code}: {}", f.description);
        }
    }

    #[test]
    fn test_f_strings_format_under_mediation() {
        let code = concat!(
            "n = 3\n",
            "name = 'ada'\n",
            "plain = f'{n} items'\n",
            "padded = f'{n:>4}|{name:<5}|'\n",
            "converted = f'{name!r} {name!s}'\n",
            "nested = f'{n:{n}}'\n",
        );
        let mut bindings = Bindings::new();
        restrictive().exec(code, &mut bindings).expect("f-strings run");
        let text = |name: &str| bindings.get(name).and_then(Value::as_str).map(str::to_owned);
        assert_eq!(text("plain").as_deref(), Some("3 items"));
        assert_eq!(text("padded").as_deref(), Some("   3|ada  |"));
        assert_eq!(text("converted").as_deref(), Some("'ada' ada"));
        assert_eq!(text("nested").as_deref(), Some("  3"));
    }

    #[test]
    fn test_augmented_assignment_keeps_its_meaning() {
        let code = concat!(
            "rows = [[1], 'ab']\n",
            "first = rows[0]\n",
            "rows[0] *= 2\n",
            "rows[1] *= 3\n",
            "class Box:\n",
            "    pass\n",
            "box = Box()\n",
            "box.label = '%d%%'\n",
            "box.label %= 50\n",
            "xs = [0]\n",
            "alias = xs\n",
            "xs *= 2\n",
            "same = alias is xs\n",
        );
        let mut bindings = Bindings::new();
        restrictive().exec(code, &mut bindings).expect("augmented assignment runs");
        assert_eq!(bindings.get("rows").map(Value::repr).as_deref(), Some("[[1, 1], 'ababab']"));
        assert_eq!(bindings.get("first").map(Value::repr).as_deref(), Some("[1, 1]"));
        assert_eq!(bindings.get("alias").map(Value::repr).as_deref(), Some("[0, 0]"));
        assert_eq!(bindings.get("same"), Some(&Value::Bool(true)));

        let mut bindings = Bindings::new();
        bindings.insert("client", Namespace::new("client").with("_count", Value::Int(1)));
        let f = failure(&restrictive(), "client._count *= 2\n", &mut bindings);
        assert_eq!(f.kind, "PermissionError");
    }

    #[test]
    fn test_modest_sizes_still_work() {
        let mut bindings = Bindings::new();
        restrictive()
            .exec(
                "a = f'{7:>4}'\nb = 'ab' * 3\nc = '5'.zfill(3)\nd = '%3d' % 7\n",
                &mut bindings,
            )
            .expect("small sizes pass");
        assert_eq!(bindings.get("a").and_then(Value::as_str), Some("   7"));
        assert_eq!(bindings.get("b").and_then(Value::as_str), Some("ababab"));
        assert_eq!(bindings.get("c").and_then(Value::as_str), Some("005"));
        assert_eq!(bindings.get("d").and_then(Value::as_str), Some("  7"));
    }
}

// =============================================================================
// Module access
// =============================================================================

mod module_access {
    use super::*;

    #[test]
    fn test_deny_takes_precedence_over_allow() {
        let mut policy = RestrictivePolicy::new();
        policy.allow_module("json");
        policy.deny_module("json");
        policy.allow_module("json");
        let f = failure(&policy.into(), "import json", &mut Bindings::new());
        assert_eq!(f.kind, "PermissionError");
    }

    #[test]
    fn test_prefix_matching_is_by_segment() {
        let mut policy = RestrictivePolicy::new();
        policy.deny_module("os");
        let policy: Policy = policy.into();
        let f = failure(&policy, "import os.path", &mut Bindings::new());
        assert_eq!(f.kind, "PermissionError");
        let f = failure(&policy, "from os import path", &mut Bindings::new());
        assert_eq!(f.kind, "PermissionError");

        let mut policy = RestrictivePolicy::new();
        policy.deny_module("os.path");
        let policy: Policy = policy.into();
        for code in [
            "import os.path",
            "from os import path",
            "from os import sep, path",
            "import os\nj = os.path.join('a', 'b')",
            "import os\nj = getattr(os, 'path')",
        ] {
            let f = failure(&policy, code, &mut Bindings::new());
            assert_eq!(f.kind, "PermissionError", "{code}");
            assert!(f.description.contains("'os.path'"), "{code}: {}", f.description);
        }
        let mut bindings = Bindings::new();
        policy
            .exec("import os\nfrom os import sep\nname = os.name\n", &mut bindings)
            .expect("siblings of a denied submodule stay reachable");
        assert_eq!(bindings.get("sep").and_then(Value::as_str), Some("/"));
    }

    #[test]
    fn test_unlisted_import_warns_exactly_once() {
        let policy = restrictive();
        let mut bindings = Bindings::new();
        let (result, logs) = with_logs(tracing::Level::WARN, || {
            policy.exec("import os\nsep = os.sep\n", &mut bindings)
        });
        result.expect("unlisted imports still load");
        assert_eq!(logs.matches("WARN").count(), 1, "logs: {logs}");
        assert!(logs.contains("imported_module=\"os\""), "logs: {logs}");
        assert_eq!(bindings.get("sep").and_then(Value::as_str), Some("/"));
    }

    #[test]
    fn test_from_import_of_unlisted_module_warns_once() {
        let policy = restrictive();
        let mut bindings = Bindings::new();
        let (result, logs) = with_logs(tracing::Level::WARN, || {
            policy.exec("from os import path\njoined = path.join('a', 'b')\n", &mut bindings)
        });
        result.expect("unlisted from-imports still load");
        assert_eq!(logs.matches("WARN").count(), 1, "logs: {logs}");
        assert!(logs.contains("imported_module=\"os\""), "logs: {logs}");
        assert_eq!(bindings.get("joined").and_then(Value::as_str), Some("a/b"));
    }

    #[test]
    fn test_allowed_import_is_silent() {
        let policy = restrictive();
        let (result, logs) = with_logs(tracing::Level::WARN, || {
            policy.exec("import json\nimport math\n", &mut Bindings::new())
        });
        result.expect("allowed imports load");
        assert!(logs.is_empty(), "logs: {logs}");
    }

    #[test]
    fn test_policy_selection_is_logged_in_runner() {
        let runner = SkillRunner::new(restrictive());
        let (response, logs) = with_logs(tracing::Level::INFO, || {
            runner.run("bot.reply('ok')\n", &serde_json::Value::Null)
        });
        assert!(response.success);
        assert!(logs.contains("Running user script under Restrictive policy"), "logs: {logs}");
    }
}

// =============================================================================
// Isolation
// =============================================================================

mod isolation {
    use super::*;

    #[test]
    fn test_fail_closed_default() {
        for name in [None, Some(""), Some("sandbox"), Some("PERMISSIVE!")] {
            let policy = get_policy(name, &tracing::Span::none());
            assert!(matches!(policy, Policy::Restrictive(_)), "{name:?}");
        }
    }

    #[test]
    fn test_output_is_suppressed_without_failing() {
        let mut bindings = Bindings::new();
        restrictive()
            .exec("r = print('hidden')\ndone = True\n", &mut bindings)
            .expect("print is allowed");
        assert!(matches!(bindings.get("r"), Some(Value::None)));
        assert!(bindings.get("done").is_some_and(Value::truthy));
    }

    #[test]
    fn test_permissive_snapshot_hides_other_keys() {
        let policy = get_policy(Some("permissive"), &tracing::Span::none());
        let mut bindings = Bindings::new();
        policy
            .exec("import os\nkeys = list(os.environ.keys())\n", &mut bindings)
            .expect("permissive run");
        let Some(Value::List(keys)) = bindings.get("keys") else {
            panic!("keys should be a list");
        };
        for key in keys {
            let key = key.as_str().expect("string key");
            assert!(DEFAULT_ENV_ALLOWLIST.contains(&key), "{key} leaked");
        }
    }

    #[test]
    fn test_primitive_names_cannot_be_rebound() {
        for code in [
            "print = 1",
            "def getattr(o, n):\n    return 1",
            "for hasattr in []:\n    pass",
            "import json as setattr",
            "class delattr:\n    pass",
            "def __builtins__():\n    pass",
        ] {
            let err = restrictive().exec(code, &mut Bindings::new()).expect_err(code);
            assert!(matches!(err, ExecError::Syntax(_)), "{code}: {err}");
        }
    }

    #[test]
    fn test_format_templates_cannot_read_private_attributes() {
        let client = || {
            let mut bindings = Bindings::new();
            bindings.insert("client", Namespace::new("client").with("_token", "s3cr3t").with("name", "api"));
            bindings
        };
        for code in [
            "leak = '{0._token}'.format(client)",
            "leak = '{c._token}'.format_map({'c': client})",
            "leak = '{0:{1._token}}'.format(1, client)",
            "leak = str.format('{0._token}', client)",
            "import string\nleak = string.Formatter().get_field('0._token', (client,), {})[0]",
            "import string\nleak = string.Formatter().format('{0._token}', client)",
        ] {
            let mut bindings = client();
            let f = failure(&restrictive(), code, &mut bindings);
            assert_eq!(f.kind, "PermissionError", "{code}: {}", f.description);
            assert!(!bindings.contains("leak"), "{code}");
        }

        let mut bindings = client();
        restrictive()
            .exec(
                "a = '{0.name}'.format(client)\nimport string\nb = string.Formatter().format('{0.name}', client)\n",
                &mut bindings,
            )
            .expect("public fields format");
        assert_eq!(bindings.get("a").and_then(Value::as_str), Some("api"));
        assert_eq!(bindings.get("b").and_then(Value::as_str), Some("api"));
    }

    #[test]
    fn test_fatal_rejection_escapes_try() {
        let code = concat!(
            "seen = []\n",
            "try:\n",
            "    x = bot._hidden\n",
            "except Exception as e:\n",
            "    seen.append(e)\n",
            "except PermissionError:\n",
            "    seen.append('permission')\n",
            "finally:\n",
            "    seen.append('finally')\n",
            "bot.reply('unreachable')\n",
        );
        let runner = SkillRunner::new(restrictive());
        let response = runner.run(code, &serde_json::Value::Null);
        assert_eq!(response.errors.len(), 1);
        assert_eq!(response.errors[0].kind, "PermissionError");
        assert_eq!(response.errors[0].line_start, 3);
        assert!(response.replies.is_empty());
    }

    #[test]
    fn test_ordinary_errors_remain_catchable() {
        let mut bindings = Bindings::new();
        restrictive()
            .exec(
                "try:\n    {}['k']\nexcept KeyError as e:\n    caught = str(e)\n",
                &mut bindings,
            )
            .expect("caught");
        assert_eq!(bindings.get("caught").and_then(Value::as_str), Some("'k'"));
    }
}
