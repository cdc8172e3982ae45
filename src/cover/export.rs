//! Persisting and merging coverage state.
//!
//! XML is the normative interchange schema; YAML and JSON mirror the same
//! tree with lower-case keys. Merging verifies the whole imported tree
//! against the registered structure before a single hit is applied.

use std::{fs::File, io::Write, path::Path};

use quick_xml::{
    events::{BytesDecl, BytesEnd, BytesStart, Event},
    Reader, Writer,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    cover::{db::CoverageDb, propagate_update, CoveredEvent, Node, NodeKind, NodeRef},
    error::{Error, Result},
};

/// One bin of a persisted leaf.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct BinRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub value: String,
    pub hits: u64,
}

/// One persisted coverage item, container or leaf.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct ItemRecord {
    pub name: String,
    pub size: u64,
    pub coverage: u64,
    pub cover_percentage: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bins: Vec<BinRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<ItemRecord>,
}

/// Document root shared by the YAML and JSON renderings.
#[derive(Debug, Serialize, Deserialize)]
struct SnapshotDoc {
    coverage: Vec<ItemRecord>,
}

/// The formats the coverage database exports to and merges from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Xml,
    Yaml,
    Json,
}

impl CoverageDb {
    /// Builds the serializable snapshot tree: top-level items in name order,
    /// children sorted by name, bins in declared order.
    pub(crate) fn snapshot(&self) -> Vec<ItemRecord> {
        self.item_names()
            .iter()
            .filter(|name| !name.contains('.'))
            .filter_map(|name| self.lookup(name))
            .map(|node| record_for(&node))
            .collect()
    }

    /// Writes the database in the requested format.
    pub fn write(&self, format: ExportFormat, out: &mut impl Write) -> Result<()> {
        match format {
            ExportFormat::Xml => self.write_xml(out),
            ExportFormat::Yaml => self.write_yaml(out),
            ExportFormat::Json => self.write_json(out),
        }
    }

    /// Writes the XML rendering of the whole database.
    pub fn write_xml(&self, out: &mut impl Write) -> Result<()> {
        let mut writer = Writer::new_with_indent(out, b' ', 2);
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
        writer.write_event(Event::Start(BytesStart::new("coverage")))?;
        for item in self.snapshot() {
            write_xml_item(&mut writer, &item)?;
        }
        writer.write_event(Event::End(BytesEnd::new("coverage")))?;
        Ok(())
    }

    /// Writes the YAML rendering of the whole database.
    pub fn write_yaml(&self, out: &mut impl Write) -> Result<()> {
        let doc = SnapshotDoc { coverage: self.snapshot() };
        serde_yaml::to_writer(out, &doc)?;
        Ok(())
    }

    /// Writes the JSON rendering of the whole database.
    pub fn write_json(&self, out: &mut impl Write) -> Result<()> {
        let doc = SnapshotDoc { coverage: self.snapshot() };
        serde_json::to_writer_pretty(out, &doc)?;
        Ok(())
    }

    /// Exports the database as XML to a file.
    pub fn export_to_xml(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut file = File::create(path)?;
        self.write_xml(&mut file)
    }

    /// Exports the database as YAML to a file.
    pub fn export_to_yaml(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut file = File::create(path)?;
        self.write_yaml(&mut file)
    }

    /// Exports the database as JSON to a file.
    pub fn export_to_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut file = File::create(path)?;
        self.write_json(&mut file)
    }

    /// Parses a previously exported file (format detected from the
    /// extension) and adds its per-bin hit counts into this database. The
    /// structures must line up exactly; the first mismatched path aborts the
    /// merge before any hit is applied.
    pub fn import_and_merge(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let records = match ext {
            "xml" => parse_xml(&text)?,
            "yaml" | "yml" => serde_yaml::from_str::<SnapshotDoc>(&text)?.coverage,
            "json" => serde_json::from_str::<SnapshotDoc>(&text)?.coverage,
            other => {
                return Err(Error::Export(format!(
                    "unsupported coverage format `{}`",
                    other
                )))
            }
        };
        self.merge_records(&records)
    }

    pub(crate) fn merge_records(&self, records: &[ItemRecord]) -> Result<()> {
        // (1) The top-level item sets must agree before anything else.
        let mut db_top: Vec<String> = self
            .item_names()
            .into_iter()
            .filter(|n| !n.contains('.'))
            .collect();
        db_top.sort();
        let mut file_top: Vec<String> = records.iter().map(|r| r.name.clone()).collect();
        file_top.sort();
        if let Some(path) = first_difference(&db_top, &file_top) {
            return Err(Error::Merge {
                path,
                detail: "top-level items differ between file and database".to_string(),
            });
        }

        // (2) Verify the whole tree, then (3) apply hits; a mismatch found
        // during verification leaves every count untouched.
        for record in records {
            self.verify_record(record)?;
        }
        let mut deferred = Vec::new();
        for record in records {
            self.apply_record(record, &mut deferred);
        }
        match deferred.into_iter().next() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn verify_record(&self, record: &ItemRecord) -> Result<()> {
        let node_ref = self.lookup(&record.name).ok_or_else(|| Error::Merge {
            path: record.name.clone(),
            detail: "item is not registered".to_string(),
        })?;

        let child_names: Option<Vec<String>> = {
            let mut node = node_ref.borrow_mut();
            let size = node.size();
            if size != record.size {
                return Err(Error::Merge {
                    path: record.name.clone(),
                    detail: format!("size {} in file, {} registered", record.size, size),
                });
            }
            if node.is_container() {
                if !record.bins.is_empty() {
                    return Err(Error::Merge {
                        path: record.name.clone(),
                        detail: "file carries bins on a container".to_string(),
                    });
                }
                Some(container_child_names(&node))
            } else {
                if !record.items.is_empty() {
                    return Err(Error::Merge {
                        path: record.name.clone(),
                        detail: "file carries children on a leaf".to_string(),
                    });
                }
                let own = leaf_bin_shapes(&mut node);
                if own.len() != record.bins.len() {
                    return Err(Error::Merge {
                        path: record.name.clone(),
                        detail: format!(
                            "{} bins in file, {} registered",
                            record.bins.len(),
                            own.len()
                        ),
                    });
                }
                for (mine, theirs) in own.iter().zip(&record.bins) {
                    if mine.0 != theirs.label || mine.1 != theirs.value {
                        return Err(Error::Merge {
                            path: record.name.clone(),
                            detail: format!("bin `{}` does not match the registered bin list", theirs.value),
                        });
                    }
                }
                None
            }
        };

        if let Some(mut mine) = child_names {
            mine.sort();
            let mut theirs: Vec<String> = record.items.iter().map(|i| i.name.clone()).collect();
            theirs.sort();
            if let Some(path) = first_difference(&mine, &theirs) {
                return Err(Error::Merge {
                    path,
                    detail: format!("children of `{}` differ between file and database", record.name),
                });
            }
            for child in &record.items {
                self.verify_record(child)?;
            }
        }
        Ok(())
    }

    fn apply_record(&self, record: &ItemRecord, deferred: &mut Vec<Error>) {
        if !record.items.is_empty() {
            for child in &record.items {
                self.apply_record(child, deferred);
            }
            return;
        }
        let node_ref = match self.lookup(&record.name) {
            Some(n) => n,
            // Verified just before; an absent item means nothing to apply.
            None => return,
        };

        let (events, delta) = {
            let mut node = node_ref.borrow_mut();
            let (weight, at_least) = (node.weight, node.at_least);
            merge_into_leaf(&mut node, record, weight, at_least)
        };
        if events.is_empty() && delta == 0 {
            return;
        }
        debug!("merged `{}`: {} newly covered bin(s)", record.name, events.len());
        propagate_update(&node_ref, &record.name, &events, delta, deferred);
    }
}

//==================//
// Snapshot helpers //
//==================//

fn container_child_names(node: &Node) -> Vec<String> {
    match &node.kind {
        NodeKind::Container { children } => {
            children.iter().map(|c| c.borrow().name.clone()).collect()
        }
        _ => Vec::new(),
    }
}

/// The (label, value-string) shapes of a leaf's bins, in declared order.
fn leaf_bin_shapes(node: &mut Node) -> Vec<(Option<String>, String)> {
    match &mut node.kind {
        NodeKind::Point(p) => p
            .bins
            .iter()
            .map(|(v, b)| (b.label.clone(), v.to_string()))
            .collect(),
        NodeKind::Cross(c) => c
            .bins()
            .keys()
            .map(|v| (None, v.to_string()))
            .collect(),
        NodeKind::Check(_) => vec![
            (Some("PASS".to_string()), "PASS".to_string()),
            (Some("FAIL".to_string()), "FAIL".to_string()),
        ],
        NodeKind::Container { .. } => Vec::new(),
    }
}

fn merge_into_leaf(
    node: &mut Node,
    record: &ItemRecord,
    weight: u64,
    at_least: u64,
) -> (Vec<CoveredEvent>, i64) {
    let mut events = Vec::new();
    let mut delta = 0i64;
    match &mut node.kind {
        NodeKind::Point(p) => {
            for (idx, bin) in record.bins.iter().enumerate() {
                if bin.hits == 0 {
                    continue;
                }
                if let Some((value, state)) = p.bins.get_index_mut(idx) {
                    let before = state.hits;
                    state.hits += bin.hits;
                    if before < at_least && state.hits >= at_least {
                        events.push(CoveredEvent {
                            bin: value.clone(),
                            label: state.label.clone(),
                        });
                        p.pending.push(value.clone());
                        delta += weight as i64;
                    }
                }
            }
        }
        NodeKind::Cross(c) => {
            for (idx, bin) in record.bins.iter().enumerate() {
                if bin.hits == 0 {
                    continue;
                }
                let mut covered = None;
                if let Some((value, state)) = c.bins().get_index_mut(idx) {
                    let before = state.hits;
                    state.hits += bin.hits;
                    if before < at_least && state.hits >= at_least {
                        covered = Some(value.clone());
                    }
                }
                if let Some(value) = covered {
                    events.push(CoveredEvent { bin: value.clone(), label: None });
                    c.pending.push(value);
                    delta += weight as i64;
                }
            }
        }
        NodeKind::Check(check) => {
            for bin in &record.bins {
                if bin.hits == 0 {
                    continue;
                }
                let label = bin.label.as_deref().unwrap_or(bin.value.as_str());
                let (mut ev, d) = check.add_hits(label, bin.hits, weight, at_least);
                events.append(&mut ev);
                delta += d;
            }
        }
        NodeKind::Container { .. } => {}
    }
    (events, delta)
}

/// First name present in only one of two sorted lists.
fn first_difference(a: &[String], b: &[String]) -> Option<String> {
    let mut ai = a.iter();
    let mut bi = b.iter();
    let (mut x, mut y) = (ai.next(), bi.next());
    loop {
        match (x, y) {
            (None, None) => return None,
            (Some(v), None) | (None, Some(v)) => return Some(v.clone()),
            (Some(va), Some(vb)) if va == vb => {
                x = ai.next();
                y = bi.next();
            }
            (Some(va), Some(vb)) => return Some(va.min(vb).clone()),
        }
    }
}

fn record_for(node_ref: &NodeRef) -> ItemRecord {
    let mut node = node_ref.borrow_mut();
    let (size, coverage) = (node.size(), node.coverage());
    let cover_percentage = node.cover_percentage();
    let name = node.name.clone();

    let mut bins = Vec::new();
    let mut items = Vec::new();
    match &mut node.kind {
        NodeKind::Container { children } => {
            let mut sorted: Vec<NodeRef> = children.clone();
            sorted.sort_by_key(|c| c.borrow().name.clone());
            items = sorted.iter().map(record_for).collect();
        }
        NodeKind::Point(p) => {
            bins = p
                .bins
                .iter()
                .map(|(v, b)| BinRecord {
                    label: b.label.clone(),
                    value: v.to_string(),
                    hits: b.hits,
                })
                .collect();
        }
        NodeKind::Cross(c) => {
            bins = c
                .bins()
                .iter()
                .map(|(v, b)| BinRecord {
                    label: None,
                    value: v.to_string(),
                    hits: b.hits,
                })
                .collect();
        }
        NodeKind::Check(c) => {
            bins = vec![
                BinRecord {
                    label: Some("PASS".to_string()),
                    value: "PASS".to_string(),
                    hits: c.pass_hits,
                },
                BinRecord {
                    label: Some("FAIL".to_string()),
                    value: "FAIL".to_string(),
                    hits: c.fail_hits,
                },
            ];
        }
    }

    ItemRecord {
        name,
        size,
        coverage,
        cover_percentage,
        bins,
        items,
    }
}

//=====================//
// XML read and write  //
//=====================//

fn write_xml_item<W: Write>(writer: &mut Writer<W>, item: &ItemRecord) -> Result<()> {
    let mut start = BytesStart::new("item");
    let (size, coverage) = (item.size.to_string(), item.coverage.to_string());
    let pct = item.cover_percentage.to_string();
    start.push_attribute(("name", item.name.as_str()));
    start.push_attribute(("size", size.as_str()));
    start.push_attribute(("coverage", coverage.as_str()));
    start.push_attribute(("cover_percentage", pct.as_str()));

    if item.bins.is_empty() && item.items.is_empty() {
        writer.write_event(Event::Empty(start))?;
        return Ok(());
    }
    writer.write_event(Event::Start(start))?;
    for bin in &item.bins {
        let mut b = BytesStart::new("bin");
        if let Some(label) = &bin.label {
            b.push_attribute(("label", label.as_str()));
        }
        let hits = bin.hits.to_string();
        b.push_attribute(("value", bin.value.as_str()));
        b.push_attribute(("hits", hits.as_str()));
        writer.write_event(Event::Empty(b))?;
    }
    for child in &item.items {
        write_xml_item(writer, child)?;
    }
    writer.write_event(Event::End(BytesEnd::new("item")))?;
    Ok(())
}

fn parse_xml(text: &str) -> Result<Vec<ItemRecord>> {
    let mut reader = Reader::from_str(text);
    let mut stack: Vec<ItemRecord> = Vec::new();
    let mut top: Vec<ItemRecord> = Vec::new();
    loop {
        match reader.read_event()? {
            Event::Start(e) => match e.name().as_ref() {
                b"coverage" => {}
                b"item" => stack.push(item_from(&e)?),
                b"bin" => push_bin(&mut stack, bin_from(&e)?)?,
                other => {
                    return Err(Error::Export(format!(
                        "unexpected element `{}` in coverage file",
                        String::from_utf8_lossy(other)
                    )))
                }
            },
            Event::Empty(e) => match e.name().as_ref() {
                b"item" => {
                    let item = item_from(&e)?;
                    attach(&mut stack, &mut top, item);
                }
                b"bin" => push_bin(&mut stack, bin_from(&e)?)?,
                other => {
                    return Err(Error::Export(format!(
                        "unexpected element `{}` in coverage file",
                        String::from_utf8_lossy(other)
                    )))
                }
            },
            Event::End(e) => {
                if e.name().as_ref() == b"item" {
                    let item = stack
                        .pop()
                        .ok_or_else(|| Error::Export("unbalanced <item> element".to_string()))?;
                    attach(&mut stack, &mut top, item);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    if !stack.is_empty() {
        return Err(Error::Export("unbalanced <item> element".to_string()));
    }
    Ok(top)
}

fn attach(stack: &mut Vec<ItemRecord>, top: &mut Vec<ItemRecord>, item: ItemRecord) {
    match stack.last_mut() {
        Some(parent) => parent.items.push(item),
        None => top.push(item),
    }
}

fn push_bin(stack: &mut Vec<ItemRecord>, bin: BinRecord) -> Result<()> {
    stack
        .last_mut()
        .ok_or_else(|| Error::Export("<bin> element outside of an <item>".to_string()))?
        .bins
        .push(bin);
    Ok(())
}

fn attr(e: &BytesStart, name: &str) -> Result<Option<String>> {
    let found = e
        .try_get_attribute(name)
        .map_err(|err| Error::Export(format!("bad attribute `{}`: {}", name, err)))?;
    match found {
        Some(a) => Ok(Some(a.unescape_value()?.into_owned())),
        None => Ok(None),
    }
}

fn required_attr(e: &BytesStart, name: &str) -> Result<String> {
    attr(e, name)?.ok_or_else(|| {
        Error::Export(format!(
            "<{}> element misses required attribute `{}`",
            String::from_utf8_lossy(e.name().as_ref()),
            name
        ))
    })
}

fn item_from(e: &BytesStart) -> Result<ItemRecord> {
    Ok(ItemRecord {
        name: required_attr(e, "name")?,
        size: parse_u64(&required_attr(e, "size")?, "size")?,
        coverage: parse_u64(&required_attr(e, "coverage")?, "coverage")?,
        cover_percentage: required_attr(e, "cover_percentage")?
            .parse::<f64>()
            .map_err(|_| Error::Export("cover_percentage is not a number".to_string()))?,
        bins: Vec::new(),
        items: Vec::new(),
    })
}

fn bin_from(e: &BytesStart) -> Result<BinRecord> {
    Ok(BinRecord {
        label: attr(e, "label")?,
        value: required_attr(e, "value")?,
        hits: parse_u64(&required_attr(e, "hits")?, "hits")?,
    })
}

fn parse_u64(s: &str, what: &str) -> Result<u64> {
    s.parse::<u64>()
        .map_err(|_| Error::Export(format!("{} `{}` is not a count", what, s)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cover::{check::CoverCheck, cross::CoverCross, point::CoverPoint};
    use crate::value::{Sample, Value};

    fn build_db() -> CoverageDb {
        let db = CoverageDb::new();
        CoverPoint::new("top.x")
            .bins([0, 1])
            .bins_labels(["lo", "hi"])
            .vname("x")
            .register(&db)
            .unwrap();
        CoverPoint::new("top.y").bins([0, 1, 2]).vname("y").register(&db).unwrap();
        CoverCross::new("top.c").items(["top.x", "top.y"]).register(&db).unwrap();
        CoverCheck::new("top.chk")
            .f_fail(|s: &Sample| s.get("x") == Some(&Value::Int(9)))
            .register(&db)
            .unwrap();
        db
    }

    fn drive(db: &CoverageDb) {
        db.sample(&["top.x", "top.y", "top.chk"], &Sample::new().with("x", 0).with("y", 2))
            .unwrap();
        db.sample(&["top.x", "top.y"], &Sample::new().with("x", 1).with("y", 2))
            .unwrap();
    }

    fn to_xml_string(db: &CoverageDb) -> String {
        let mut out = Vec::new();
        db.write_xml(&mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_xml_schema_shape() {
        let db = build_db();
        drive(&db);
        let xml = to_xml_string(&db);
        assert!(xml.contains("<coverage>"));
        assert!(xml.contains("<item name=\"top\""));
        assert!(xml.contains("<bin label=\"lo\" value=\"0\" hits=\"1\"/>"));
        assert!(xml.contains("<bin value=\"(0, 2)\" hits=\"1\"/>"));
        assert!(xml.contains("<bin label=\"PASS\" value=\"PASS\" hits=\"1\"/>"));
    }

    #[test]
    fn test_xml_round_trip_restores_counts() {
        let db = build_db();
        drive(&db);
        let xml = to_xml_string(&db);
        let records = parse_xml(&xml).unwrap();

        let fresh = build_db();
        fresh.merge_records(&records).unwrap();

        for name in ["top", "top.x", "top.y", "top.c", "top.chk"] {
            let a = db.get(name).unwrap();
            let b = fresh.get(name).unwrap();
            assert_eq!(a.detailed_coverage(), b.detailed_coverage(), "{}", name);
            assert_eq!(a.cover_percentage(), b.cover_percentage(), "{}", name);
        }
    }

    #[test]
    fn test_yaml_round_trip_restores_counts() {
        let db = build_db();
        drive(&db);
        let mut out = Vec::new();
        db.write_yaml(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let records = serde_yaml::from_str::<SnapshotDoc>(&text).unwrap().coverage;

        let fresh = build_db();
        fresh.merge_records(&records).unwrap();
        assert_eq!(
            db.get("top").unwrap().detailed_coverage(),
            fresh.get("top").unwrap().detailed_coverage()
        );
    }

    #[test]
    fn test_json_round_trip_restores_counts() {
        let db = build_db();
        drive(&db);
        let mut out = Vec::new();
        db.write_json(&mut out).unwrap();
        let records = serde_json::from_str::<SnapshotDoc>(&String::from_utf8(out).unwrap())
            .unwrap()
            .coverage;

        let fresh = build_db();
        fresh.merge_records(&records).unwrap();
        assert_eq!(
            db.get("top.c").unwrap().detailed_coverage(),
            fresh.get("top.c").unwrap().detailed_coverage()
        );
    }

    #[test]
    fn test_merge_with_zero_hits_changes_nothing() {
        let db = build_db();
        drive(&db);
        let before = db.get("top").unwrap().detailed_coverage();
        let pct = db.get("top").unwrap().cover_percentage();

        // A freshly built database exports all-zero hit counts.
        let empty = build_db();
        let records = parse_xml(&to_xml_string(&empty)).unwrap();
        db.merge_records(&records).unwrap();

        assert_eq!(db.get("top").unwrap().detailed_coverage(), before);
        assert_eq!(db.get("top").unwrap().cover_percentage(), pct);
    }

    #[test]
    fn test_merge_adds_hits_elementwise() {
        let db = build_db();
        drive(&db);
        let records = parse_xml(&to_xml_string(&db)).unwrap();
        db.merge_records(&records).unwrap();
        let detailed = db.get("top.x").unwrap().detailed_coverage();
        assert_eq!(detailed[&Value::Int(0)], 2);
        assert_eq!(detailed[&Value::Int(1)], 2);
    }

    #[test]
    fn test_merge_rejects_structure_mismatch_naming_path() {
        let db = build_db();
        let other = CoverageDb::new();
        CoverPoint::new("top.x").bins([0, 1]).bins_labels(["lo", "hi"]).vname("x").register(&other).unwrap();
        CoverPoint::new("top.y").bins([0, 1]).vname("y").register(&other).unwrap();

        let records = parse_xml(&to_xml_string(&other)).unwrap();
        let err = db.merge_records(&records).unwrap_err();
        match err {
            Error::Merge { path, .. } => assert_eq!(path, "top"),
            other => panic!("expected merge error, got {:?}", other),
        }
    }

    #[test]
    fn test_merge_rejects_differing_bins() {
        let db = build_db();
        drive(&db);
        let mut records = parse_xml(&to_xml_string(&db)).unwrap();
        records[0].items[2].bins[0].value = "7".to_string();
        let err = db.merge_records(&records).unwrap_err();
        assert!(matches!(err, Error::Merge { .. }));
    }

    #[test]
    fn test_merge_can_fail_a_check() {
        let db = build_db();
        drive(&db);
        assert_eq!(db.get("top.chk").unwrap().coverage(), 1);

        let mut records = parse_xml(&to_xml_string(&db)).unwrap();
        // items sorted by name: top.c, top.chk, top.x, top.y
        records[0].items[1].bins[1].hits = 1;
        db.merge_records(&records).unwrap();
        assert_eq!(db.get("top.chk").unwrap().coverage(), 0);
    }

    #[test]
    fn test_unknown_extension_rejected() {
        let db = build_db();
        let err = db.import_and_merge("/tmp/definitely-missing.toml").unwrap_err();
        // Either unreadable or unsupported; both abort the merge.
        assert!(matches!(err, Error::Export(_) | Error::Io(_)));
    }
}
