//! Character template parser and registry (`template/*.xml`).
//!
//! ```xml
//! <model name="Maid">
//!   <property>
//!     <any name="宠爱" alias="Favor" default="5"/>
//!     <any name="压力" alias="Stress" text="javascript">this.Favor * 2</any>
//!   </property>
//! </model>
//! ```

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fs;
use std::path::Path;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde_json::{Number, Value};
use tracing::{debug, info, warn};

use super::formula::Formula;
use crate::alias::AliasSnapshot;
use crate::store::Attributes;
use crate::{BridgeError, Result};

/// Formula dialects whose bodies are evaluated as arithmetic.
const ARITHMETIC_DIALECTS: &[&str] = &["javascript", "js", "expr"];

/// One field of a character template.
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateField {
    /// Localized storage key.
    pub display_name: String,
    /// Stable identifier used by scripts.
    pub alias: String,
    /// Formula dialect (`text` attribute).
    pub dialect: Option<String>,
    pub formula: Option<String>,
    pub default_value: Option<f64>,
}

/// A parsed character template.
#[derive(Debug, Clone, PartialEq)]
pub struct CharacterTemplate {
    pub name: String,
    pub fields: Vec<TemplateField>,
}

fn template_err(msg: impl Into<String>) -> BridgeError {
    BridgeError::Template(msg.into())
}

fn attributes_of(e: &BytesStart<'_>) -> Result<HashMap<String, String>> {
    let mut attrs = HashMap::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|e| template_err(e.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| template_err(e.to_string()))?
            .into_owned();
        attrs.insert(key, value);
    }
    Ok(attrs)
}

fn field_from_attrs(attrs: &HashMap<String, String>) -> Option<TemplateField> {
    let display_name = attrs.get("name").filter(|s| !s.is_empty())?.clone();
    let alias = attrs.get("alias").filter(|s| !s.is_empty())?.clone();
    let default_value = attrs.get("default").and_then(|raw| {
        let parsed = raw.trim().parse::<f64>().ok();
        if parsed.is_none() {
            warn!(field = %display_name, "Ignoring non-numeric default '{}'", raw);
        }
        parsed
    });
    Some(TemplateField {
        display_name,
        alias,
        dialect: attrs.get("text").cloned(),
        formula: None,
        default_value,
    })
}

/// Parse template markup.
///
/// Fields missing `name` or `alias` are skipped. Duplicate display names or
/// aliases make the whole template invalid.
pub fn parse_template(xml: &str) -> Result<CharacterTemplate> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut name: Option<String> = None;
    let mut fields = Vec::new();
    let mut in_property = false;
    let mut current: Option<TemplateField> = None;
    let mut body = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.name().as_ref() {
                b"model" => name = attributes_of(&e)?.get("name").cloned(),
                b"property" => in_property = true,
                b"any" if in_property => {
                    current = field_from_attrs(&attributes_of(&e)?);
                    body.clear();
                }
                _ => {}
            },
            Ok(Event::Empty(e)) => match e.name().as_ref() {
                b"model" => name = attributes_of(&e)?.get("name").cloned(),
                b"any" if in_property => {
                    if let Some(field) = field_from_attrs(&attributes_of(&e)?) {
                        fields.push(field);
                    }
                }
                _ => {}
            },
            Ok(Event::Text(t)) => {
                if current.is_some() {
                    body.push_str(&t.unescape().map_err(|e| template_err(e.to_string()))?);
                }
            }
            Ok(Event::CData(c)) => {
                if current.is_some() {
                    body.push_str(&String::from_utf8_lossy(&c.into_inner()));
                }
            }
            Ok(Event::End(e)) => match e.name().as_ref() {
                b"property" => in_property = false,
                b"any" => {
                    if let Some(mut field) = current.take() {
                        let text = body.trim();
                        if field.dialect.is_some() && !text.is_empty() {
                            field.formula = Some(text.to_string());
                        }
                        fields.push(field);
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(template_err(format!(
                    "malformed markup at position {}: {}",
                    reader.error_position(),
                    e
                )))
            }
        }
    }

    let name = name
        .filter(|n| !n.trim().is_empty())
        .ok_or_else(|| template_err("missing <model name=...>"))?;

    let mut names = HashSet::new();
    let mut aliases = HashSet::new();
    for field in &fields {
        if !names.insert(field.display_name.as_str()) {
            return Err(template_err(format!(
                "duplicate field '{}' in template '{}'",
                field.display_name, name
            )));
        }
        if !aliases.insert(field.alias.as_str()) {
            return Err(template_err(format!(
                "duplicate alias '{}' in template '{}'",
                field.alias, name
            )));
        }
    }

    Ok(CharacterTemplate { name, fields })
}

impl CharacterTemplate {
    /// Map alias → display name.
    pub fn alias_map(&self) -> HashMap<String, String> {
        self.fields
            .iter()
            .map(|f| (f.alias.clone(), f.display_name.clone()))
            .collect()
    }

    fn evaluable_formula(field: &TemplateField) -> Option<&str> {
        let formula = field.formula.as_deref()?;
        let dialect = field.dialect.as_deref()?.to_ascii_lowercase();
        ARITHMETIC_DIALECTS
            .contains(&dialect.as_str())
            .then_some(formula)
    }

    /// Compute default attribute values keyed by display name.
    ///
    /// Plain fields take their literal default (or 0). Formula fields are
    /// evaluated in dependency order; `this.<alias>` and `this.<name>` both
    /// resolve. A field whose formula is invalid is set to 0 and logged. A
    /// dependency cycle fails with [`BridgeError::CircularFormula`].
    pub fn generate_default_attributes(&self) -> Result<Attributes> {
        let mut index_of: HashMap<&str, usize> = HashMap::new();
        for (i, field) in self.fields.iter().enumerate() {
            index_of.insert(field.display_name.as_str(), i);
            index_of.entry(field.alias.as_str()).or_insert(i);
        }

        let mut values: Vec<Option<f64>> = vec![None; self.fields.len()];
        let mut formulas: BTreeMap<usize, Formula> = BTreeMap::new();

        for (i, field) in self.fields.iter().enumerate() {
            match Self::evaluable_formula(field) {
                Some(src) => match Formula::parse(src) {
                    Ok(formula) => {
                        formulas.insert(i, formula);
                    }
                    Err(e) => {
                        let err = BridgeError::Formula {
                            field: field.display_name.clone(),
                            reason: e.to_string(),
                        };
                        warn!(template = %self.name, "{}", err);
                        values[i] = Some(0.0);
                    }
                },
                None => {
                    if field.formula.is_some() {
                        debug!(
                            template = %self.name,
                            field = %field.display_name,
                            "Formula dialect not evaluated, using default"
                        );
                    }
                    values[i] = Some(field.default_value.unwrap_or(0.0));
                }
            }
        }

        // Kahn's algorithm over formula fields.
        let mut pending: HashMap<usize, usize> = HashMap::new();
        let mut dependents: HashMap<usize, Vec<usize>> = HashMap::new();
        for (&i, formula) in &formulas {
            let mut deps = HashSet::new();
            for reference in formula.references() {
                if let Some(&j) = index_of.get(reference) {
                    if formulas.contains_key(&j) && deps.insert(j) {
                        dependents.entry(j).or_default().push(i);
                    }
                }
            }
            pending.insert(i, deps.len());
        }

        let mut roots: Vec<usize> = pending
            .iter()
            .filter(|(_, &n)| n == 0)
            .map(|(&i, _)| i)
            .collect();
        roots.sort_unstable();
        let mut ready: VecDeque<usize> = roots.into();

        let mut evaluated = 0;
        while let Some(i) = ready.pop_front() {
            evaluated += 1;
            let formula = &formulas[&i];
            let lookup = |name: &str| index_of.get(name).and_then(|&j| values[j]);
            let value = match formula.eval(lookup) {
                Ok(v) => v,
                Err(e) => {
                    let err = BridgeError::Formula {
                        field: self.fields[i].display_name.clone(),
                        reason: e.to_string(),
                    };
                    warn!(template = %self.name, "{}", err);
                    0.0
                }
            };
            values[i] = Some(value);

            if let Some(next) = dependents.get(&i) {
                for &k in next {
                    if let Some(n) = pending.get_mut(&k) {
                        *n -= 1;
                        if *n == 0 {
                            ready.push_back(k);
                        }
                    }
                }
            }
        }

        if evaluated < formulas.len() {
            let cycle: Vec<String> = formulas
                .keys()
                .filter(|&&i| values[i].is_none())
                .map(|&i| self.fields[i].display_name.clone())
                .collect();
            return Err(BridgeError::CircularFormula(cycle));
        }

        let mut attributes = Attributes::new();
        for (field, value) in self.fields.iter().zip(values) {
            attributes.insert(field.display_name.clone(), number_value(value.unwrap_or(0.0)));
        }
        Ok(attributes)
    }
}

/// Integral values are stored as integers.
fn number_value(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        Value::from(value as i64)
    } else {
        Number::from_f64(value).map(Value::Number).unwrap_or(Value::from(0))
    }
}

/// Templates registered by loaded plugins.
#[derive(Debug, Default)]
pub struct TemplateRegistry {
    templates: BTreeMap<String, (CharacterTemplate, String)>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a template, replacing any previous one of the same name.
    pub fn register(&mut self, template: CharacterTemplate, plugin: &str) {
        if let Some((_, previous)) = self.templates.get(&template.name) {
            if previous != plugin {
                warn!(
                    template = %template.name,
                    "Template from '{}' replaced by '{}'", previous, plugin
                );
            }
        }
        self.templates
            .insert(template.name.clone(), (template, plugin.to_string()));
    }

    pub fn get(&self, name: &str) -> Option<&CharacterTemplate> {
        self.templates.get(name).map(|(t, _)| t)
    }

    pub fn names(&self) -> Vec<String> {
        self.templates.keys().cloned().collect()
    }

    /// Drop templates registered by `plugin`.
    pub fn remove_plugin(&mut self, plugin: &str) -> usize {
        let before = self.templates.len();
        self.templates.retain(|_, (_, owner)| owner != plugin);
        before - self.templates.len()
    }

    /// Alias maps of all templates.
    pub fn alias_snapshot(&self) -> AliasSnapshot {
        let mut snapshot = AliasSnapshot::new();
        for (name, (template, _)) in &self.templates {
            snapshot.insert(name.clone(), template.alias_map());
        }
        snapshot
    }
}

/// Load every `*.xml` template under `dir` into `registry`.
///
/// Returns the names of the registered templates. Templates whose formulas
/// form a cycle are still registered; the cycle is reported as a warning.
pub fn load_templates(
    dir: &Path,
    plugin: &str,
    registry: &mut TemplateRegistry,
) -> Result<Vec<String>> {
    let mut names = Vec::new();
    if !dir.is_dir() {
        return Ok(names);
    }

    let mut files: Vec<_> = fs::read_dir(dir)?
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "xml"))
        .collect();
    files.sort();

    for path in files {
        let parsed = fs::read_to_string(&path)
            .map_err(BridgeError::from)
            .and_then(|content| parse_template(&content));
        match parsed {
            Ok(template) => {
                if let Err(e) = template.generate_default_attributes() {
                    warn!(plugin = %plugin, template = %template.name, "{}", e);
                }
                info!(
                    plugin = %plugin,
                    template = %template.name,
                    fields = template.fields.len(),
                    "Loaded template"
                );
                names.push(template.name.clone());
                registry.register(template, plugin);
            }
            Err(e) => warn!(plugin = %plugin, path = %path.display(), "Skipping template: {}", e),
        }
    }

    Ok(names)
}
