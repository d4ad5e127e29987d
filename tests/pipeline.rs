use std::cell::Cell;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use csv::StringRecord;
use flate2::write::GzEncoder;
use flate2::Compression;

use ad_export_cleaner::{
    CleanerConfig, CleanerError, Interrupt, InterruptFlag, NoInterrupt, PipelineDriver, PipelineState, StripMode,
    StripOutcome, TagStripper,
};

const HEADER: [&str; 11] = [
    "id", "political", "not_political", "title", "html", "message", "entities", "targets", "targeting", "targetings",
    "advertiser",
];

/// Stops the row loop once the given number of rows has been written.
struct StopAfter(u64);

impl Interrupt for StopAfter {
    fn requested(&self, rows_consumed: u64) -> bool {
        rows_consumed >= self.0
    }
}

/// Fires on the given poll, counting the post-transform check after the row loop.
struct TriggerOnPoll {
    polls: Cell<u64>,
    at: u64,
}

impl Interrupt for TriggerOnPoll {
    fn requested(&self, _rows_consumed: u64) -> bool {
        self.polls.set(self.polls.get() + 1);
        self.polls.get() >= self.at
    }
}

fn ad_id(i: usize) -> String {
    format!("hyperfeed_story_id_{:04}", i)
}

fn entity_count(i: usize) -> usize {
    if i % 10 == 3 {
        1
    } else {
        i % 3
    }
}

fn ad_row(i: usize) -> Vec<String> {
    let entities = if i % 10 == 3 {
        "[{\"entity\": \"ACLU\"".to_string()
    } else {
        let items: Vec<String> = (0..i % 3)
            .map(|k| format!(r#"{{"entity":"Entity {} of {}","entity_type":"Organization"}}"#, k, i))
            .collect();
        format!("[{}]", items.join(","))
    };
    let targets = if i % 4 == 0 {
        "[]".to_string()
    } else if i % 7 == 1 {
        "{bad".to_string()
    } else {
        r#"[{"target":"Age","segment":"18 and older"}]"#.to_string()
    };
    vec![
        ad_id(i),
        (i % 5).to_string(),
        "0".to_string(),
        format!("Advertiser {}", i),
        format!("<div class=\"ad\"><p>Ad number {}</p></div>", i),
        format!("<p>Ad number {}, \"quoted\", <b>bold</b></p>", i),
        entities,
        targets,
        if i % 2 == 0 { "<div>Women in Ohio</div>".to_string() } else { String::new() },
        "<ul><li>Age: 18+</li></ul>".to_string(),
        "ACLU".to_string(),
    ]
}

fn write_input(path: &Path, rows: usize) {
    let mut writer = csv::Writer::from_path(path).unwrap();
    writer.write_record(HEADER).unwrap();
    for i in 0..rows {
        writer.write_record(ad_row(i)).unwrap();
    }
    writer.flush().unwrap();
}

fn config_for(input: &Path) -> CleanerConfig {
    let mut config = CleanerConfig::new(input).unwrap();
    config.strip_mode = StripMode::Builtin;
    config.show_progress = false;
    config
}

fn read_rows(path: &Path) -> Vec<StringRecord> {
    let mut reader = csv::Reader::from_path(path).unwrap();
    reader.records().map(|r| r.unwrap()).collect()
}

fn ids(path: &Path) -> Vec<String> {
    read_rows(path).iter().map(|r| r[0].to_string()).collect()
}

fn all_outputs(config: &CleanerConfig) -> [PathBuf; 5] {
    let o = &config.outputs;
    [o.metadata.clone(), o.text.clone(), o.entities.clone(), o.targets.clone(), o.pure_text.clone()]
}

#[test]
fn reference_row_is_split_into_four_tables() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("ads.csv");
    fs::write(
        &input,
        "id,html,message,entities,targets,targeting,targetings,lang\n\
         A1,<div>x</div>,<p>Hello</p>,\"[{\"\"entity\"\":\"\"ACLU\"\",\"\"entity_type\"\":\"\"Organization\"\"}]\",[],<b>Women</b>,,en-US\n",
    )
    .unwrap();
    let config = config_for(&input);

    let summary = PipelineDriver::new(config.clone()).run(&NoInterrupt).unwrap();

    assert_eq!(summary.state, PipelineState::Done);
    assert_eq!(summary.strip, StripOutcome::Stripped);
    assert_eq!(summary.pure_text_lines, Some(1));
    let o = &config.outputs;
    assert_eq!(fs::read_to_string(&o.entities).unwrap(), "id,entity,entity_type\nA1,ACLU,Organization\n");
    assert_eq!(fs::read_to_string(&o.targets).unwrap(), "id,target,segment\nA1,none,none\n");
    assert_eq!(fs::read_to_string(&o.text).unwrap(), "id,message\nA1,Hello\n");
    assert_eq!(fs::read_to_string(&o.metadata).unwrap(), "id,targeting,targetings,lang\nA1,Women,,en-US\n");
    assert_eq!(fs::read_to_string(&o.pure_text).unwrap(), "Hello\n");
    assert!(!o.intermediate_text().exists());
}

#[cfg(unix)]
#[test]
fn sed_backend_produces_same_text_as_builtin() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("ads.csv");
    write_input(&input, 25);

    let builtin = config_for(&input);
    PipelineDriver::new(builtin.clone()).run(&NoInterrupt).unwrap();
    let builtin_text = fs::read(&builtin.outputs.text).unwrap();

    let mut sed = config_for(&input);
    sed.strip_mode = StripMode::Sed;
    sed.outputs.text = dir.path().join("sed_text.csv");
    let summary = PipelineDriver::new(sed.clone()).run(&NoInterrupt).unwrap();

    assert!(summary.strip.is_stripped());
    assert_eq!(fs::read(&sed.outputs.text).unwrap(), builtin_text);
}

#[test]
fn every_stream_carries_exactly_the_input_ids() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("ads.csv");
    write_input(&input, 60);
    let config = config_for(&input);

    let summary = PipelineDriver::new(config.clone()).run(&NoInterrupt).unwrap();

    let expected: Vec<String> = (0..60).map(ad_id).collect();
    let o = &config.outputs;
    assert_eq!(ids(&o.metadata), expected);
    assert_eq!(ids(&o.text), expected);
    assert_eq!(summary.rows_consumed, 60);

    let known: HashSet<&String> = expected.iter().collect();
    assert!(ids(&o.entities).iter().all(|id| known.contains(id)));
    assert!(ids(&o.targets).iter().all(|id| known.contains(id)));
}

#[test]
fn entity_and_target_rows_follow_the_decode_policy() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("ads.csv");
    write_input(&input, 40);
    let config = config_for(&input);

    let summary = PipelineDriver::new(config.clone()).run(&NoInterrupt).unwrap();

    let entities = read_rows(&config.outputs.entities);
    let targets = read_rows(&config.outputs.targets);
    for i in 0..40 {
        let id = ad_id(i);
        let mine: Vec<&StringRecord> = entities.iter().filter(|r| r[0] == id).collect();
        assert_eq!(mine.len(), entity_count(i), "entity rows for {}", id);
        if i % 10 == 3 {
            assert_eq!((&mine[0][1], &mine[0][2]), ("not specified", "not_specified"));
        }

        let mine: Vec<&StringRecord> = targets.iter().filter(|r| r[0] == id).collect();
        assert_eq!(mine.len(), 1, "target rows for {}", id);
        let pair = (&mine[0][1], &mine[0][2]);
        if i % 4 == 0 {
            assert_eq!(pair, ("none", "none"));
        } else if i % 7 == 1 {
            assert_eq!(pair, ("not specified", "not_specified"));
        } else {
            assert_eq!(pair, ("Age", "18 and older"));
        }
    }
    assert_eq!(summary.stats.malformed_entities, 4);
    assert_eq!(summary.stats.malformed_targets, (0..40).filter(|i| i % 4 != 0 && i % 7 == 1).count() as u64);
}

#[test]
fn finalized_text_has_no_markup() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("ads.csv");
    write_input(&input, 30);
    let config = config_for(&input);

    PipelineDriver::new(config.clone()).run(&NoInterrupt).unwrap();

    let text = read_rows(&config.outputs.text);
    for (i, row) in text.iter().enumerate() {
        assert_eq!(&row[1], format!("Ad number {}, \"quoted\", bold", i));
    }
    let pure = fs::read_to_string(&config.outputs.pure_text).unwrap();
    assert_eq!(pure.lines().count(), 30);
    assert_eq!(pure.lines().next(), Some("\"Ad number 0, \"\"quoted\"\", bold\""));

    let metadata = read_rows(&config.outputs.metadata);
    assert_eq!(&metadata[0][4], "Women in Ohio");
    assert_eq!(&metadata[0][5], "Age: 18+");
    assert_eq!(&metadata[1][4], "");
}

#[test]
fn zero_row_cap_writes_headers_only() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("ads.csv");
    write_input(&input, 10);
    let mut config = config_for(&input);
    config.num_rows = Some(0);

    let summary = PipelineDriver::new(config.clone()).run(&NoInterrupt).unwrap();

    assert_eq!(summary.state, PipelineState::Done);
    assert_eq!(summary.rows_consumed, 0);
    let o = &config.outputs;
    assert_eq!(
        fs::read_to_string(&o.metadata).unwrap(),
        "id,political,not_political,title,targeting,targetings,advertiser\n"
    );
    assert_eq!(fs::read_to_string(&o.text).unwrap(), "id,message\n");
    assert_eq!(fs::read_to_string(&o.entities).unwrap(), "id,entity,entity_type\n");
    assert_eq!(fs::read_to_string(&o.targets).unwrap(), "id,target,segment\n");
    assert_eq!(fs::read_to_string(&o.pure_text).unwrap(), "");
}

#[test]
fn row_cap_limits_and_oversized_cap_changes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("ads.csv");
    write_input(&input, 20);

    let mut capped = config_for(&input);
    capped.num_rows = Some(7);
    let summary = PipelineDriver::new(capped.clone()).run(&NoInterrupt).unwrap();
    assert_eq!(summary.rows_consumed, 7);
    assert_eq!(ids(&capped.outputs.metadata), (0..7).map(ad_id).collect::<Vec<_>>());

    let uncapped = config_for(&input);
    PipelineDriver::new(uncapped.clone()).run(&NoInterrupt).unwrap();
    let first: Vec<Vec<u8>> = all_outputs(&uncapped).iter().map(|p| fs::read(p).unwrap()).collect();

    let mut oversized = config_for(&input);
    oversized.num_rows = Some(1_000);
    PipelineDriver::new(oversized.clone()).run(&NoInterrupt).unwrap();
    let second: Vec<Vec<u8>> = all_outputs(&oversized).iter().map(|p| fs::read(p).unwrap()).collect();

    assert_eq!(first, second);
}

#[test]
fn rerunning_gives_identical_outputs() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("ads.csv");
    write_input(&input, 50);
    let config = config_for(&input);

    PipelineDriver::new(config.clone()).run(&NoInterrupt).unwrap();
    let first: Vec<Vec<u8>> = all_outputs(&config).iter().map(|p| fs::read(p).unwrap()).collect();
    PipelineDriver::new(config.clone()).run(&NoInterrupt).unwrap();
    let second: Vec<Vec<u8>> = all_outputs(&config).iter().map(|p| fs::read(p).unwrap()).collect();

    assert_eq!(first, second);
}

#[test]
fn interruption_keeps_consistent_partial_outputs() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("ads.csv");
    write_input(&input, 100);
    let config = config_for(&input);

    let mut driver = PipelineDriver::new(config.clone());
    let summary = driver.run(&StopAfter(37)).unwrap();

    assert_eq!(driver.state(), PipelineState::AbortedDone);
    assert!(driver.state().is_terminal());
    assert!(summary.aborted());
    assert_eq!(summary.rows_consumed, 37);
    assert_eq!(summary.pure_text_lines, None);

    let expected: Vec<String> = (0..37).map(ad_id).collect();
    let o = &config.outputs;
    assert_eq!(ids(&o.metadata), expected);
    assert_eq!(ids(&o.text), expected);

    let target_ids: Vec<String> = ids(&o.targets);
    let distinct: Vec<String> = target_ids.iter().fold(Vec::new(), |mut acc, id| {
        if acc.last() != Some(id) {
            acc.push(id.clone());
        }
        acc
    });
    assert_eq!(distinct, expected);
    let entity_ids: HashSet<String> = ids(&o.entities).into_iter().collect();
    assert!(entity_ids.iter().all(|id| expected.contains(id)));
    assert_eq!(ids(&o.entities).len(), (0..37).map(entity_count).sum::<usize>());

    assert!(read_rows(&o.text).iter().all(|r| !r[1].contains('<')));
    assert!(!o.intermediate_text().exists());
    assert!(!o.pure_text.exists());
}

#[test]
fn interrupt_flag_set_before_start_aborts_immediately() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("ads.csv");
    write_input(&input, 5);
    let config = config_for(&input);
    let flag = InterruptFlag::new();
    flag.trigger();

    let summary = PipelineDriver::new(config.clone()).run(&flag).unwrap();

    assert_eq!(summary.state, PipelineState::AbortedDone);
    assert_eq!(summary.rows_consumed, 0);
    assert_eq!(fs::read_to_string(&config.outputs.text).unwrap(), "id,message\n");
}

#[test]
fn gzip_export_is_read_transparently() {
    let dir = tempfile::tempdir().unwrap();
    let plain = dir.path().join("plain.csv");
    write_input(&plain, 12);
    let input = dir.path().join("ads.csv.gz");
    let mut encoder = GzEncoder::new(File::create(&input).unwrap(), Compression::default());
    encoder.write_all(&fs::read(&plain).unwrap()).unwrap();
    encoder.finish().unwrap();
    let config = config_for(&input);

    let summary = PipelineDriver::new(config.clone()).run(&NoInterrupt).unwrap();

    assert_eq!(config.outputs.metadata, dir.path().join("ads_metadata.csv"));
    assert_eq!(summary.rows_consumed, 12);
    assert_eq!(ids(&config.outputs.text), (0..12).map(ad_id).collect::<Vec<_>>());
}

#[test]
fn missing_input_creates_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_for(&dir.path().join("absent.csv"));

    let err = PipelineDriver::new(config.clone()).run(&NoInterrupt).unwrap_err();

    assert!(matches!(err, CleanerError::InputNotFound(_)));
    assert!(all_outputs(&config).iter().all(|p| !p.exists()));
    assert!(!config.outputs.intermediate_text().exists());
}

#[test]
fn missing_column_creates_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("ads.csv");
    fs::write(&input, "id,html,message,entities,targets\nA1,,hi,[],[]\n").unwrap();
    let config = config_for(&input);

    let err = PipelineDriver::new(config.clone()).run(&NoInterrupt).unwrap_err();

    assert!(matches!(err, CleanerError::MissingColumn { .. }));
    assert!(all_outputs(&config).iter().all(|p| !p.exists()));
}

#[test]
fn broken_row_still_finalizes_text() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("ads.csv");
    let mut content = String::from("id,html,message,entities,targets,targeting,targetings\n");
    content.push_str("A1,,<p>one</p>,[],[],,\n");
    content.push_str("A2,,<p>two</p>,[],[]\n");
    fs::write(&input, content).unwrap();
    let config = config_for(&input);

    let err = PipelineDriver::new(config.clone()).run(&NoInterrupt).unwrap_err();

    assert!(matches!(err, CleanerError::Csv(_)));
    assert_eq!(fs::read_to_string(&config.outputs.text).unwrap(), "id,message\nA1,one\n");
    assert!(!config.outputs.intermediate_text().exists());
    assert_eq!(ids(&config.outputs.metadata), vec!["A1".to_string()]);
}

#[test]
fn unavailable_transform_keeps_text_and_still_derives_pure_text() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("ads.csv");
    write_input(&input, 3);
    let mut config = config_for(&input);
    config.strip_mode = StripMode::Sed;

    let summary = PipelineDriver::new(config.clone())
        .with_stripper(TagStripper::new(StripMode::Sed).with_program("no-such-sed-here"))
        .run(&NoInterrupt)
        .unwrap();

    assert_eq!(summary.state, PipelineState::Done);
    assert!(matches!(summary.strip, StripOutcome::CopiedThrough { .. }));
    let text = read_rows(&config.outputs.text);
    assert_eq!(&text[0][1], "<p>Ad number 0, \"quoted\", <b>bold</b></p>");
    assert_eq!(summary.pure_text_lines, Some(3));
    assert!(!config.outputs.intermediate_text().exists());
}

#[test]
fn invalid_bytes_in_entities_fall_back_and_later_rows_survive() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("ads.csv");
    let mut content = b"id,html,message,entities,targets,targeting,targetings\n".to_vec();
    content.extend_from_slice(b"A1,,<p>one</p>,[],[],,\n");
    content.extend_from_slice(b"A2,,<p>caf\xe9</p>,\"[{\"\"entity\"\":\"\"caf\xe9\"\"}]\",[],,\n");
    content.extend_from_slice(b"A3,,<p>three</p>,\"[{\"\"entity\"\":\"\"NRA\"\"}]\",[],,\n");
    fs::write(&input, content).unwrap();
    let config = config_for(&input);

    let summary = PipelineDriver::new(config.clone()).run(&NoInterrupt).unwrap();

    assert_eq!(summary.state, PipelineState::Done);
    assert_eq!(summary.rows_consumed, 3);
    assert_eq!(summary.stats.malformed_entities, 1);
    let o = &config.outputs;
    assert_eq!(
        fs::read_to_string(&o.entities).unwrap(),
        "id,entity,entity_type\nA2,not specified,not_specified\nA3,NRA,\n"
    );
    assert_eq!(fs::read_to_string(&o.text).unwrap(), "id,message\nA1,one\nA2,caf\u{FFFD}\nA3,three\n");
    assert_eq!(ids(&o.metadata), vec!["A1", "A2", "A3"]);
}

#[test]
fn interrupt_during_finalization_skips_pure_text() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("ads.csv");
    write_input(&input, 3);
    let config = config_for(&input);
    // polls 1-3 precede the rows, 4 precedes end of input, 5 follows the transform
    let interrupt = TriggerOnPoll { polls: Cell::new(0), at: 5 };

    let summary = PipelineDriver::new(config.clone()).run(&interrupt).unwrap();

    assert_eq!(summary.rows_consumed, 3);
    assert_eq!(summary.state, PipelineState::AbortedDone);
    assert!(summary.strip.is_stripped());
    assert!(read_rows(&config.outputs.text).iter().all(|r| !r[1].contains('<')));
    assert_eq!(summary.pure_text_lines, None);
    assert!(!config.outputs.pure_text.exists());
}
