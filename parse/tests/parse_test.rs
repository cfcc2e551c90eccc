use std::collections::HashMap;
use std::io;

use mmk_parse::{parse, Loader, RuleSets};

struct MapLoader {
    files: HashMap<String, String>,
}

impl Loader for MapLoader {
    fn load(&mut self, _from: Option<&str>, request: &str) -> io::Result<String> {
        self.files
            .get(request)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, request.to_owned()))
    }
}

fn parse_files(files: &[(&str, &str)]) -> RuleSets {
    let mut loader = MapLoader {
        files: files
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect(),
    };
    parse(&mut loader, "mmkfile").expect("valid build file")
}

#[test]
fn full_file_round_trip() {
    let sets = parse_files(&[(
        "mmkfile",
        concat!(
            "# top-level comment\n",
            "var CC = cc\n",
            "var CFLAGS = -Wall -O2\n",
            "\n",
            "'(.*)\\.o' : '(.*)\\.c'\n",
            "\t$CC $CFLAGS -c ${match_1}.c -o ${match_1}.o\n",
            "\n",
            "prog : main.o util.o\n",
            "\t$CC main.o util.o -o prog\n",
            ": clean :\n",
            "\trm -f prog *.o\n",
            "\n",
            "main : prog\n",
            "\tmmkecho built\n",
        ),
    )]);

    // All three rules survive, searchable in reverse declaration order.
    assert_eq!(sets.sets.len(), 3);
    assert!(sets.rule_for("main", "").is_some());
    assert!(sets.rule_for("prog", "clean").is_some());
    assert!(sets.rule_for("anything.o", "").is_some());
    assert!(sets.rule_for("anything.o", "clean").is_none());

    let vars = sets.var_map();
    assert_eq!(vars.get("CC"), Some(&"cc".to_owned()));
    assert_eq!(vars.get("CFLAGS"), Some(&"-Wall -O2".to_owned()));

    let prog = sets.rule_for("prog", "").unwrap();
    assert_eq!(
        prog.select_body("").unwrap().dependencies,
        Some(vec!["main.o".to_owned(), "util.o".to_owned()])
    );
}

#[test]
fn includes_merge_rules_and_shadow() {
    let sets = parse_files(&[
        (
            "mmkfile",
            "<common.mmk\ngreet :\n\techo overridden\nmain : greet\n\techo done\n",
        ),
        (
            "common.mmk",
            "greet :\n\techo from-common\nextra :\n\techo extra\n",
        ),
    ]);

    // Included rules are spliced before the including file's own rules, so
    // the local `greet` wins the reverse-order search.
    let greet = sets.rule_for("greet", "").unwrap();
    assert_eq!(
        greet.select_body("").unwrap().lines,
        vec!["echo overridden".to_owned()]
    );
    assert!(sets.rule_for("extra", "").is_some());
}

#[test]
fn ruletype_templates_cross_include_boundary() {
    let sets = parse_files(&[
        ("mmkfile", "<types.mmk\npkg : pkg.src\n\tbuild pkg\n: publish\n"),
        (
            "types.mmk",
            "ruletype publish\n  : publish\n\tpush $target\n",
        ),
    ]);
    let body = sets
        .rule_for("pkg", "publish")
        .unwrap()
        .select_body("publish")
        .unwrap()
        .clone();
    assert_eq!(body.lines, vec!["push $target".to_owned()]);
    assert_eq!(body.dependencies, Some(vec!["pkg.src".to_owned()]));
}

#[test]
fn parse_error_names_position() {
    let mut files = HashMap::new();
    files.insert("mmkfile".to_owned(), "main : ok\nvar = broken\n".to_owned());
    let mut loader = MapLoader { files };
    let err = parse(&mut loader, "mmkfile").expect_err("should fail");
    let rendered = format!("{}", err);
    assert!(rendered.contains("mmkfile:2:"), "got: {}", rendered);
}
