//! Column definition rendering.
//!
//! Turns field declarations into the exact MySQL column definitions the
//! migration planner diffs against `SHOW CREATE TABLE` output, and
//! collects index and foreign-key memberships along the way.

use std::collections::BTreeMap;

use super::{ColumnDef, FieldDecl, FieldKind, IndexDef, OnDelete, SchemaError, TagSet};

/// A reference column waiting for target-schema resolution.
#[derive(Debug, Clone)]
pub(crate) struct PendingRef {
    pub column: String,
    pub target: &'static str,
    pub on_delete: OnDelete,
}

#[derive(Debug, Default)]
pub(crate) struct RenderOutput {
    pub columns: Vec<ColumnDef>,
    pub indexes: BTreeMap<String, IndexDef>,
    pub refs: Vec<PendingRef>,
    pub has_fake_delete: bool,
}

struct Rendered {
    definition: String,
    not_null_by_default: bool,
    default_null_if_nullable: bool,
    default_value: Option<String>,
}

impl Rendered {
    fn new(definition: impl Into<String>) -> Self {
        Self {
            definition: definition.into(),
            not_null_by_default: false,
            default_null_if_nullable: true,
            default_value: None,
        }
    }

    fn not_null(mut self) -> Self {
        self.not_null_by_default = true;
        self
    }

    fn default_value(mut self, value: impl Into<String>) -> Self {
        self.default_value = Some(value.into());
        self
    }

    fn no_default_null(mut self) -> Self {
        self.default_null_if_nullable = false;
        self
    }
}

pub(crate) fn render_fields(
    entity: &'static str,
    fields: &[FieldDecl],
    enums: &BTreeMap<String, Vec<String>>,
    id_kinds: &BTreeMap<&'static str, FieldKind>,
    prefix: &str,
    out: &mut RenderOutput,
) -> Result<(), SchemaError> {
    for field in fields {
        let tags = TagSet::parse(field.tags);
        if tags.has("ignore") {
            continue;
        }
        let column_name = format!("{prefix}{}", field.name);

        if matches!(field.kind, FieldKind::Bool) && column_name == "FakeDelete" {
            // Rendered as a synthetic unsigned column at the end of the
            // table, same width as the primary key.
            out.has_fake_delete = true;
            continue;
        }

        collect_indexes(entity, &column_name, &tags, out)?;

        if let FieldKind::Ref(target) = field.kind {
            let on_delete = if tags.has("cascade") {
                OnDelete::Cascade
            } else {
                OnDelete::Restrict
            };
            out.refs.push(PendingRef {
                column: column_name.clone(),
                target,
                on_delete,
            });
            let covered = out
                .indexes
                .values()
                .any(|index| index.columns.get(&1).is_some_and(|c| *c == column_name));
            if !covered {
                out.indexes.insert(
                    column_name.clone(),
                    IndexDef {
                        unique: false,
                        columns: BTreeMap::from([(1, column_name.clone())]),
                    },
                );
            }
        }

        if let FieldKind::Struct(sub_fields) = field.kind {
            let sub_prefix = format!("{prefix}{}", field.name);
            render_fields(entity, &sub_fields(), enums, id_kinds, &sub_prefix, out)?;
            continue;
        }

        let required = tags.is_true("required");
        let rendered = render_kind(entity, field, &column_name, &tags, enums, id_kinds)?;

        let mut definition = rendered.definition;
        let not_null = rendered.not_null_by_default || required;
        if not_null {
            definition.push_str(" NOT NULL");
        }
        if let Some(default) = rendered.default_value
            && column_name != "ID"
        {
            definition.push_str(" DEFAULT ");
            definition.push_str(&default);
        } else if !not_null && rendered.default_null_if_nullable {
            definition.push_str(" DEFAULT NULL");
        }
        out.columns.push(ColumnDef {
            definition: format!("`{column_name}` {definition}"),
            name: column_name,
            nullable: !not_null,
        });
    }
    Ok(())
}

/// Append the synthetic soft-delete column, unsigned and as wide as the
/// primary key.
pub(crate) fn push_fake_delete_column(out: &mut RenderOutput) {
    let id_type = out.columns[0]
        .definition
        .split(' ')
        .nth(1)
        .unwrap_or("int(10)")
        .to_string();
    out.columns.push(ColumnDef {
        name: "FakeDelete".to_string(),
        definition: format!("`FakeDelete` {id_type} unsigned NOT NULL DEFAULT '0'"),
        nullable: false,
    });
}

fn collect_indexes(
    entity: &'static str,
    column_name: &str,
    tags: &TagSet,
    out: &mut RenderOutput,
) -> Result<(), SchemaError> {
    for key in ["index", "unique"] {
        let Some(attribute) = tags.get(key) else {
            continue;
        };
        if attribute == "true" {
            return Err(SchemaError::invalid_tag(
                entity,
                column_name,
                format!("`{key}` requires an index name"),
            ));
        }
        let unique = key == "unique";
        for member in attribute.split(',') {
            let mut parts = member.splitn(2, ':');
            let index_name = parts.next().unwrap_or_default().trim();
            let position: u16 = match parts.next() {
                Some(raw) => raw.trim().parse().map_err(|_| {
                    SchemaError::invalid_tag(
                        entity,
                        column_name,
                        format!("invalid index position `{raw}` in index `{index_name}`"),
                    )
                })?,
                None => 1,
            };
            out.indexes
                .entry(index_name.to_string())
                .and_modify(|index| {
                    index.columns.insert(position, column_name.to_string());
                })
                .or_insert_with(|| IndexDef {
                    unique,
                    columns: BTreeMap::from([(position, column_name.to_string())]),
                });
        }
    }
    Ok(())
}

fn render_kind(
    entity: &'static str,
    field: &FieldDecl,
    column_name: &str,
    tags: &TagSet,
    enums: &BTreeMap<String, Vec<String>>,
    id_kinds: &BTreeMap<&'static str, FieldKind>,
) -> Result<Rendered, SchemaError> {
    let rendered = match field.kind {
        FieldKind::U16 if tags.is_true("year") => {
            let rendered = Rendered::new("year(4)");
            if tags.is_true("required") {
                rendered.default_value("'0000'")
            } else {
                rendered
            }
        }
        FieldKind::U8
        | FieldKind::U16
        | FieldKind::U32
        | FieldKind::U64
        | FieldKind::I8
        | FieldKind::I16
        | FieldKind::I32
        | FieldKind::I64 => Rendered::new(int_definition(field.kind, tags))
            .not_null()
            .default_value("'0'"),
        FieldKind::Bool => Rendered::new("tinyint(1)").not_null().default_value("'0'"),
        FieldKind::F32 => float_definition(entity, column_name, "float", tags)?,
        FieldKind::F64 => float_definition(entity, column_name, "double", tags)?,
        FieldKind::Str => string_definition(entity, column_name, tags, enums, false)?,
        FieldKind::Json => string_definition(entity, column_name, tags, enums, true)?,
        FieldKind::Bytes => Rendered::new("blob").no_default_null(),
        FieldKind::Time => time_definition(tags, field.nullable),
        FieldKind::Ref(target) => {
            let id_kind = id_kinds
                .get(target)
                .copied()
                .ok_or_else(|| SchemaError::EntityNotRegistered {
                    name: target.to_string(),
                })?;
            Rendered::new(int_definition(id_kind, tags))
        }
        FieldKind::Struct(_) => unreachable!("embedded structs are flattened by the caller"),
    };
    Ok(rendered)
}

fn int_definition(kind: FieldKind, tags: &TagSet) -> &'static str {
    match kind {
        FieldKind::U8 => "tinyint(3) unsigned",
        FieldKind::U16 => "smallint(5) unsigned",
        FieldKind::U32 => {
            if tags.is_true("mediumint") {
                "mediumint(8) unsigned"
            } else {
                "int(10) unsigned"
            }
        }
        FieldKind::U64 => "bigint(20) unsigned",
        FieldKind::I8 => "tinyint(4)",
        FieldKind::I16 => "smallint(6)",
        FieldKind::I32 => {
            if tags.is_true("mediumint") {
                "mediumint(9)"
            } else {
                "int(11)"
            }
        }
        FieldKind::I64 => "bigint(20)",
        _ => "int(11)",
    }
}

fn float_definition(
    entity: &'static str,
    column_name: &str,
    base: &str,
    tags: &TagSet,
) -> Result<Rendered, SchemaError> {
    let (definition, default) = match tags.get("decimal") {
        Some(decimal) => {
            let malformed = || {
                SchemaError::invalid_tag(
                    entity,
                    column_name,
                    format!("malformed decimal specification `{decimal}`"),
                )
            };
            let (precision, scale) = decimal.split_once(',').ok_or_else(malformed)?;
            let precision: u8 = precision.trim().parse().map_err(|_| malformed())?;
            let scale: u8 = scale.trim().parse().map_err(|_| malformed())?;
            (
                format!("decimal({precision},{scale})"),
                format!("'{:.*}'", usize::from(scale), 0.0),
            )
        }
        None => (base.to_string(), "'0'".to_string()),
    };
    let unsigned = tags.get("unsigned").map(|v| v == "true").unwrap_or(true);
    let definition = if unsigned {
        format!("{definition} unsigned")
    } else {
        definition
    };
    Ok(Rendered::new(definition).not_null().default_value(default))
}

fn string_definition(
    entity: &'static str,
    column_name: &str,
    tags: &TagSet,
    enums: &BTreeMap<String, Vec<String>>,
    force_max: bool,
) -> Result<Rendered, SchemaError> {
    for set_kind in ["enum", "set"] {
        let Some(enum_name) = tags.get(set_kind) else {
            continue;
        };
        let values = enums
            .get(enum_name)
            .ok_or_else(|| SchemaError::EnumNotRegistered {
                name: enum_name.to_string(),
            })?;
        let list = values
            .iter()
            .map(|value| format!("'{value}'"))
            .collect::<Vec<_>>()
            .join(",");
        let mut rendered = Rendered::new(format!("{set_kind}({list})"));
        if tags.is_true("required") {
            rendered = rendered.default_value(format!("'{}'", values[0]));
        }
        return Ok(rendered);
    }

    let length = tags.get("length").unwrap_or("255");
    if force_max || length == "max" {
        return Ok(Rendered::new("mediumtext").no_default_null());
    }
    let parsed: u32 = length.parse().map_err(|_| {
        SchemaError::invalid_tag(entity, column_name, format!("invalid length `{length}`"))
    })?;
    if parsed > 65_535 {
        return Err(SchemaError::invalid_tag(
            entity,
            column_name,
            format!("length `{parsed}` exceeds 65535"),
        ));
    }
    let mut rendered = Rendered::new(format!("varchar({parsed})"));
    if tags.is_true("required") {
        rendered = rendered.default_value("''");
    }
    Ok(rendered)
}

fn time_definition(tags: &TagSet, nullable: bool) -> Rendered {
    if tags.is_true("time") {
        let rendered = Rendered::new("datetime");
        if nullable { rendered } else { rendered.not_null() }
    } else {
        let rendered = Rendered::new("date");
        if nullable {
            rendered
        } else {
            rendered.not_null().default_value("'0001-01-01'")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(fields: Vec<FieldDecl>) -> RenderOutput {
        let enums = BTreeMap::from([(
            "Color".to_string(),
            vec!["red".to_string(), "blue".to_string()],
        )]);
        let id_kinds = BTreeMap::from([("User", FieldKind::U64)]);
        let mut out = RenderOutput::default();
        render_fields("Test", &fields, &enums, &id_kinds, "", &mut out).expect("render");
        out
    }

    #[test]
    fn varchar_with_length() {
        let out = render(vec![FieldDecl::new("Name", FieldKind::Str).tags("length=40")]);
        assert_eq!(out.columns[0].definition, "`Name` varchar(40) DEFAULT NULL");
    }

    #[test]
    fn required_string_gets_empty_default() {
        let out = render(vec![
            FieldDecl::new("Name", FieldKind::Str).tags("length=40;required"),
        ]);
        assert_eq!(
            out.columns[0].definition,
            "`Name` varchar(40) NOT NULL DEFAULT ''"
        );
    }

    #[test]
    fn integer_defaults() {
        let out = render(vec![
            FieldDecl::new("Age", FieldKind::I32),
            FieldDecl::new("Count", FieldKind::U32).tags("mediumint=true"),
        ]);
        assert_eq!(out.columns[0].definition, "`Age` int(11) NOT NULL DEFAULT '0'");
        assert_eq!(
            out.columns[1].definition,
            "`Count` mediumint(8) unsigned NOT NULL DEFAULT '0'"
        );
    }

    #[test]
    fn enum_and_set() {
        let out = render(vec![
            FieldDecl::new("Color", FieldKind::Str).tags("enum=Color;required"),
            FieldDecl::new("Options", FieldKind::Str).tags("set=Color"),
        ]);
        assert_eq!(
            out.columns[0].definition,
            "`Color` enum('red','blue') NOT NULL DEFAULT 'red'"
        );
        assert_eq!(
            out.columns[1].definition,
            "`Options` set('red','blue') DEFAULT NULL"
        );
    }

    #[test]
    fn decimal_scale_default() {
        let out = render(vec![
            FieldDecl::new("Price", FieldKind::F64).tags("decimal=10,2"),
        ]);
        assert_eq!(
            out.columns[0].definition,
            "`Price` decimal(10,2) unsigned NOT NULL DEFAULT '0.00'"
        );
    }

    #[test]
    fn dates_and_datetimes() {
        let out = render(vec![
            FieldDecl::new("Born", FieldKind::Time),
            FieldDecl::new("Seen", FieldKind::Time).nullable().tags("time=true"),
        ]);
        assert_eq!(
            out.columns[0].definition,
            "`Born` date NOT NULL DEFAULT '0001-01-01'"
        );
        assert_eq!(out.columns[1].definition, "`Seen` datetime DEFAULT NULL");
    }

    #[test]
    fn year_column() {
        let out = render(vec![
            FieldDecl::new("Issued", FieldKind::U16).tags("year=true;required"),
        ]);
        assert_eq!(
            out.columns[0].definition,
            "`Issued` year(4) NOT NULL DEFAULT '0000'"
        );
    }

    #[test]
    fn reference_gets_foreign_key_and_index() {
        let out = render(vec![
            FieldDecl::new("Owner", FieldKind::Ref("User")).nullable().tags("cascade"),
        ]);
        assert_eq!(
            out.columns[0].definition,
            "`Owner` bigint(20) unsigned DEFAULT NULL"
        );
        assert_eq!(out.refs.len(), 1);
        assert_eq!(out.refs[0].on_delete, OnDelete::Cascade);
        assert!(out.indexes.contains_key("Owner"));
    }

    #[test]
    fn composite_index_positions() {
        let out = render(vec![
            FieldDecl::new("First", FieldKind::Str).tags("index=FullName:1"),
            FieldDecl::new("Last", FieldKind::Str).tags("index=FullName:2"),
        ]);
        let index = &out.indexes["FullName"];
        assert_eq!(index.columns[&1], "First");
        assert_eq!(index.columns[&2], "Last");
        assert!(!index.unique);
    }

    #[test]
    fn fake_delete_is_stripped_and_synthesized() {
        let mut out = render(vec![
            FieldDecl::new("ID", FieldKind::U32),
            FieldDecl::new("FakeDelete", FieldKind::Bool),
        ]);
        assert!(out.has_fake_delete);
        assert_eq!(out.columns.len(), 1);
        push_fake_delete_column(&mut out);
        assert_eq!(
            out.columns[1].definition,
            "`FakeDelete` int(10) unsigned NOT NULL DEFAULT '0'"
        );
    }

    #[test]
    fn malformed_decimal_is_rejected() {
        let enums = BTreeMap::new();
        let id_kinds = BTreeMap::new();
        let mut out = RenderOutput::default();
        let fields = vec![FieldDecl::new("Price", FieldKind::F64).tags("decimal=ten,2")];
        let err = render_fields("Test", &fields, &enums, &id_kinds, "", &mut out).unwrap_err();
        assert!(matches!(err, SchemaError::InvalidTag { .. }));
    }

    #[test]
    fn length_cap_enforced() {
        let enums = BTreeMap::new();
        let id_kinds = BTreeMap::new();
        let mut out = RenderOutput::default();
        let fields = vec![FieldDecl::new("Body", FieldKind::Str).tags("length=70000")];
        let err = render_fields("Test", &fields, &enums, &id_kinds, "", &mut out).unwrap_err();
        assert!(matches!(err, SchemaError::InvalidTag { .. }));
    }
}
