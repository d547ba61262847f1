//! Reference data model: types, forms, properties and tag properties.
//!
//! The runtime treats the model as a collaborator that normalizes values,
//! validates comparators and reports deprecations. [`Model::new`] carries the
//! built-in base types, the `syn:tag` form and the `.created`/`.seen`
//! universal properties; callers extend it with [`Model::add_type`] and
//! [`Model::add_form`].

pub mod time;
mod types;

use std::collections::BTreeMap;

use tracing::warn;

use crate::error::{Result, StormError};

pub use types::{Matcher, OverlapKind};

/// Built-in type kinds every declared type resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Base {
    /// UTF-8 string.
    Str,
    /// 64-bit integer.
    Int,
    /// Boolean.
    Bool,
    /// Epoch milliseconds.
    Time,
    /// `(min, max)` time interval.
    Ival,
    /// 128-bit hex identifier.
    Guid,
    /// Tuple of named typed fields.
    Comp,
    /// Homogeneous list.
    Array,
    /// `(form, value)` reference to any node.
    Ndef,
}

impl Base {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "str" => Base::Str,
            "int" => Base::Int,
            "bool" => Base::Bool,
            "time" => Base::Time,
            "ival" => Base::Ival,
            "guid" => Base::Guid,
            "comp" => Base::Comp,
            "array" => Base::Array,
            "ndef" => Base::Ndef,
            _ => return None,
        })
    }
}

/// Options refining a base type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypeOpts {
    /// `str`: lowercase on normalization.
    pub lower: bool,
    /// `int`: inclusive minimum.
    pub min: Option<i64>,
    /// `int`: inclusive maximum.
    pub max: Option<i64>,
    /// `comp`: `(field, type)` pairs.
    pub fields: Vec<(String, String)>,
    /// `array`: element type.
    pub elem: Option<String>,
}

impl TypeOpts {
    /// Lowercasing string.
    pub fn lower() -> Self {
        Self {
            lower: true,
            ..Self::default()
        }
    }

    /// Array of `elem`.
    pub fn array(elem: &str) -> Self {
        Self {
            elem: Some(elem.into()),
            ..Self::default()
        }
    }

    /// Comp with the given fields.
    pub fn comp(fields: &[(&str, &str)]) -> Self {
        Self {
            fields: fields
                .iter()
                .map(|(name, ty)| ((*name).to_owned(), (*ty).to_owned()))
                .collect(),
            ..Self::default()
        }
    }

    fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    fn merged(&self, over: &TypeOpts) -> TypeOpts {
        TypeOpts {
            lower: self.lower || over.lower,
            min: over.min.or(self.min),
            max: over.max.or(self.max),
            fields: if over.fields.is_empty() {
                self.fields.clone()
            } else {
                over.fields.clone()
            },
            elem: over.elem.clone().or_else(|| self.elem.clone()),
        }
    }
}

/// Declaration metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DefInfo {
    /// Usage produces deprecation warnings.
    pub deprecated: bool,
    /// Human readable description.
    pub doc: String,
}

impl DefInfo {
    /// Info flagged as deprecated.
    pub fn deprecated() -> Self {
        Self {
            deprecated: true,
            doc: String::new(),
        }
    }
}

/// Declared type.
#[derive(Debug, Clone)]
pub struct TypeDef {
    /// Type name.
    pub name: String,
    /// Parent type this one was derived from, if any.
    pub parent: Option<String>,
    /// Resolved base kind.
    pub base: Base,
    /// Effective options.
    pub opts: TypeOpts,
    /// Whether this type, or a type it builds on, is deprecated.
    pub deprecated: bool,
}

/// Property declaration used when adding forms and universal properties.
#[derive(Debug, Clone)]
pub struct PropSpec {
    /// Relative property name.
    pub name: String,
    /// Type name and refining options. `None` is a malformed declaration.
    pub ty: Option<(String, TypeOpts)>,
    /// Declaration metadata.
    pub info: DefInfo,
}

impl PropSpec {
    /// Property of an existing type.
    pub fn new(name: &str, ty: &str) -> Self {
        Self {
            name: name.into(),
            ty: Some((ty.into(), TypeOpts::default())),
            info: DefInfo::default(),
        }
    }

    /// Property of a type refined by options.
    pub fn with_opts(name: &str, ty: &str, opts: TypeOpts) -> Self {
        Self {
            name: name.into(),
            ty: Some((ty.into(), opts)),
            info: DefInfo::default(),
        }
    }

    /// Property declared without a type.
    pub fn untyped(name: &str) -> Self {
        Self {
            name: name.into(),
            ty: None,
            info: DefInfo::default(),
        }
    }

    /// Marks the property deprecated.
    pub fn deprecated(mut self) -> Self {
        self.info.deprecated = true;
        self
    }
}

/// Resolved property.
#[derive(Debug, Clone)]
pub struct PropDef {
    /// Relative name (`hehe`, `seen`).
    pub name: String,
    /// Full name (`test:str:hehe`, `.seen`).
    pub full: String,
    /// Type name.
    pub ty: String,
    /// Declaration metadata.
    pub info: DefInfo,
}

/// Resolved form.
#[derive(Debug, Clone)]
pub struct FormDef {
    /// Form name; also the name of its primary type.
    pub name: String,
    /// Secondary properties.
    pub props: BTreeMap<String, PropDef>,
    /// Declaration metadata.
    pub info: DefInfo,
}

/// What a full property name refers to.
#[derive(Debug, Clone, Copy)]
pub enum PropTarget<'a> {
    /// The form's primary value.
    Primary(&'a FormDef),
    /// A secondary property of a form.
    Prop(&'a FormDef, &'a PropDef),
    /// A universal property, optionally restricted to one form.
    Univ(Option<&'a FormDef>, &'a PropDef),
}

/// Type and form registry.
#[derive(Debug, Clone)]
pub struct Model {
    types: BTreeMap<String, TypeDef>,
    forms: BTreeMap<String, FormDef>,
    univs: BTreeMap<String, PropDef>,
    tagprops: BTreeMap<String, PropDef>,
}

impl Default for Model {
    fn default() -> Self {
        Self::new()
    }
}

impl Model {
    /// Model with base types, `syn:tag`, `.created` and `.seen`.
    pub fn new() -> Self {
        let mut model = Model {
            types: BTreeMap::new(),
            forms: BTreeMap::new(),
            univs: BTreeMap::new(),
            tagprops: BTreeMap::new(),
        };
        for (name, base) in [
            ("str", Base::Str),
            ("int", Base::Int),
            ("bool", Base::Bool),
            ("time", Base::Time),
            ("ival", Base::Ival),
            ("guid", Base::Guid),
            ("ndef", Base::Ndef),
        ] {
            model.types.insert(
                name.into(),
                TypeDef {
                    name: name.into(),
                    parent: None,
                    base,
                    opts: TypeOpts::default(),
                    deprecated: false,
                },
            );
        }
        model.types.insert(
            "syn:tag".into(),
            TypeDef {
                name: "syn:tag".into(),
                parent: Some("str".into()),
                base: Base::Str,
                opts: TypeOpts::lower(),
                deprecated: false,
            },
        );
        let tag_props = vec![
            PropSpec::new("up", "syn:tag"),
            PropSpec::new("base", "str"),
            PropSpec::new("depth", "int"),
        ];
        model.insert_form("syn:tag", DefInfo::default(), tag_props);
        model.insert_univ(PropDef {
            name: "created".into(),
            full: ".created".into(),
            ty: "time".into(),
            info: DefInfo::default(),
        });
        model.insert_univ(PropDef {
            name: "seen".into(),
            full: ".seen".into(),
            ty: "ival".into(),
            info: DefInfo::default(),
        });
        model
    }

    fn insert_form(&mut self, name: &str, info: DefInfo, props: Vec<PropSpec>) {
        let mut form = FormDef {
            name: name.into(),
            props: BTreeMap::new(),
            info,
        };
        for spec in props {
            if let Some((ty, _)) = &spec.ty {
                form.props.insert(
                    spec.name.clone(),
                    PropDef {
                        full: format!("{name}:{}", spec.name),
                        name: spec.name.clone(),
                        ty: ty.clone(),
                        info: spec.info.clone(),
                    },
                );
            }
        }
        self.forms.insert(name.into(), form);
    }

    fn insert_univ(&mut self, prop: PropDef) {
        self.univs.insert(prop.name.clone(), prop);
    }

    /// Declares `name` derived from `base` (a base kind or an existing type).
    pub fn add_type(&mut self, name: &str, base: &str, opts: TypeOpts, info: DefInfo) -> Result<()> {
        let typedef = self.derive_type(name, base, &opts, info.deprecated)?;
        self.types.insert(name.into(), typedef);
        Ok(())
    }

    fn derive_type(&self, name: &str, base: &str, opts: &TypeOpts, deprecated: bool) -> Result<TypeDef> {
        let (kind, parent, inherited, parent_deprecated) = match self.types.get(base) {
            Some(parent) => (
                parent.base,
                Some(parent.name.clone()),
                parent.opts.clone(),
                parent.deprecated,
            ),
            None => match Base::from_name(base) {
                Some(kind) => (kind, None, TypeOpts::default(), false),
                None => {
                    return Err(StormError::NoSuchType { name: base.into() });
                }
            },
        };
        let opts = inherited.merged(opts);
        match kind {
            Base::Array => {
                let Some(elem) = &opts.elem else {
                    return Err(StormError::BadTypeDef {
                        name: name.into(),
                        mesg: "array type requires an element type".into(),
                    });
                };
                let Some(elemdef) = self.types.get(elem) else {
                    return Err(StormError::NoSuchType { name: elem.clone() });
                };
                if elemdef.deprecated {
                    warn!(
                        array = name,
                        elem = elem.as_str(),
                        "storm.model.deprecated_array_type"
                    );
                }
            }
            Base::Comp => {
                if opts.fields.is_empty() {
                    return Err(StormError::BadTypeDef {
                        name: name.into(),
                        mesg: "comp type requires fields".into(),
                    });
                }
                for (field, ty) in &opts.fields {
                    let Some(fielddef) = self.types.get(ty) else {
                        return Err(StormError::NoSuchType { name: ty.clone() });
                    };
                    if fielddef.deprecated {
                        warn!(
                            comp = name,
                            field = field.as_str(),
                            ty = ty.as_str(),
                            "storm.model.deprecated_comp_field"
                        );
                    }
                }
            }
            _ => {}
        }
        Ok(TypeDef {
            name: name.into(),
            parent,
            base: kind,
            opts,
            deprecated: deprecated || parent_deprecated,
        })
    }

    fn resolve_prop_type(&mut self, full: &str, spec: &PropSpec) -> Result<String> {
        let Some((ty, opts)) = &spec.ty else {
            return Err(StormError::BadPropDef {
                name: full.into(),
                mesg: "property definition requires a type".into(),
            });
        };
        if opts.is_empty() {
            if !self.types.contains_key(ty) {
                return Err(StormError::NoSuchType { name: ty.clone() });
            }
            return Ok(ty.clone());
        }
        let typedef = self.derive_type(full, ty, opts, false)?;
        self.types.insert(full.into(), typedef);
        Ok(full.into())
    }

    /// Declares a form. A type of the same name must already exist.
    pub fn add_form(&mut self, name: &str, info: DefInfo, props: Vec<PropSpec>) -> Result<()> {
        if !name.contains(':') {
            return Err(StormError::BadFormDef {
                name: name.into(),
                mesg: "form names must contain a ':' namespace separator".into(),
            });
        }
        if !self.types.contains_key(name) {
            return Err(StormError::NoSuchType { name: name.into() });
        }
        let mut resolved = BTreeMap::new();
        for spec in &props {
            let full = format!("{name}:{}", spec.name);
            let ty = self.resolve_prop_type(&full, spec)?;
            resolved.insert(
                spec.name.clone(),
                PropDef {
                    name: spec.name.clone(),
                    full,
                    ty,
                    info: spec.info.clone(),
                },
            );
        }
        self.forms.insert(
            name.into(),
            FormDef {
                name: name.into(),
                props: resolved,
                info,
            },
        );
        Ok(())
    }

    /// Adds a secondary property to an existing form.
    pub fn add_form_prop(&mut self, form: &str, spec: PropSpec) -> Result<()> {
        if !self.forms.contains_key(form) {
            return Err(StormError::NoSuchForm { name: form.into() });
        }
        let full = format!("{form}:{}", spec.name);
        let ty = self.resolve_prop_type(&full, &spec)?;
        let prop = PropDef {
            name: spec.name.clone(),
            full,
            ty,
            info: spec.info,
        };
        if let Some(formdef) = self.forms.get_mut(form) {
            formdef.props.insert(prop.name.clone(), prop);
        }
        Ok(())
    }

    /// Removes a secondary property.
    pub fn del_form_prop(&mut self, form: &str, prop: &str) -> Result<()> {
        let formdef = self
            .forms
            .get_mut(form)
            .ok_or_else(|| StormError::NoSuchForm { name: form.into() })?;
        formdef
            .props
            .remove(prop)
            .map(|_| ())
            .ok_or_else(|| StormError::NoSuchProp {
                name: format!("{form}:{prop}"),
            })
    }

    /// Declares a universal property.
    pub fn add_univ_prop(&mut self, spec: PropSpec) -> Result<()> {
        let full = format!(".{}", spec.name);
        let ty = self.resolve_prop_type(&full, &spec)?;
        self.insert_univ(PropDef {
            name: spec.name.clone(),
            full,
            ty,
            info: spec.info,
        });
        Ok(())
    }

    /// Removes a universal property.
    pub fn del_univ_prop(&mut self, name: &str) -> Result<()> {
        self.univs
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StormError::NoSuchUniv {
                name: format!(".{name}"),
            })
    }

    /// Declares a tag property. Array types are rejected.
    pub fn add_tag_prop(&mut self, spec: PropSpec) -> Result<()> {
        let full = format!("#:{}", spec.name);
        if let Some((ty, opts)) = &spec.ty {
            let is_array = opts.elem.is_some()
                || ty == "array"
                || self.types.get(ty).is_some_and(|t| t.base == Base::Array);
            if is_array {
                return Err(StormError::BadPropDef {
                    name: spec.name.clone(),
                    mesg: "tag properties may not be array types".into(),
                });
            }
        }
        let ty = self.resolve_prop_type(&full, &spec)?;
        self.tagprops.insert(
            spec.name.clone(),
            PropDef {
                name: spec.name.clone(),
                full,
                ty,
                info: spec.info,
            },
        );
        Ok(())
    }

    /// Looks up a type.
    pub fn ty(&self, name: &str) -> Option<&TypeDef> {
        self.types.get(name)
    }

    /// Looks up a type or fails with `NoSuchType`.
    pub fn req_type(&self, name: &str) -> Result<&TypeDef> {
        self.types
            .get(name)
            .ok_or_else(|| StormError::NoSuchType { name: name.into() })
    }

    /// Looks up a form.
    pub fn form(&self, name: &str) -> Option<&FormDef> {
        self.forms.get(name)
    }

    /// Looks up a form or fails with `NoSuchForm`.
    pub fn req_form(&self, name: &str) -> Result<&FormDef> {
        self.forms
            .get(name)
            .ok_or_else(|| StormError::NoSuchForm { name: name.into() })
    }

    /// All forms.
    pub fn forms(&self) -> impl Iterator<Item = &FormDef> {
        self.forms.values()
    }

    /// Looks up a universal property by relative name.
    pub fn univ(&self, name: &str) -> Option<&PropDef> {
        self.univs.get(name)
    }

    /// Looks up a tag property.
    pub fn tag_prop(&self, name: &str) -> Option<&PropDef> {
        self.tagprops.get(name)
    }

    /// Resolves a form-relative property or fails with `NoSuchProp`.
    pub fn req_prop(&self, form: &str, prop: &str) -> Result<&PropDef> {
        self.req_form(form)?
            .props
            .get(prop)
            .ok_or_else(|| StormError::NoSuchProp {
                name: format!("{form}:{prop}"),
            })
    }

    /// Resolves a universal property or fails with `NoSuchProp`.
    pub fn req_univ(&self, name: &str) -> Result<&PropDef> {
        self.univs.get(name).ok_or_else(|| StormError::NoSuchProp {
            name: format!(".{name}"),
        })
    }

    /// Resolves a full property name (`form`, `form:prop`, `.univ`, `form.univ`).
    pub fn resolve(&self, full: &str) -> Result<PropTarget<'_>> {
        if let Some(univ) = full.strip_prefix('.') {
            return Ok(PropTarget::Univ(None, self.req_univ(univ)?));
        }
        if let Some((form, univ)) = full.split_once('.') {
            let formdef = self.req_form(form)?;
            return Ok(PropTarget::Univ(Some(formdef), self.req_univ(univ)?));
        }
        if let Some(formdef) = self.forms.get(full) {
            return Ok(PropTarget::Primary(formdef));
        }
        let owner = self
            .forms
            .values()
            .filter(|form| {
                full.len() > form.name.len() + 1
                    && full.starts_with(form.name.as_str())
                    && full.as_bytes()[form.name.len()] == b':'
            })
            .max_by_key(|form| form.name.len());
        match owner {
            Some(formdef) => {
                let rel = &full[formdef.name.len() + 1..];
                match formdef.props.get(rel) {
                    Some(prop) => Ok(PropTarget::Prop(formdef, prop)),
                    None => Err(StormError::NoSuchProp { name: full.into() }),
                }
            }
            None => Err(StormError::NoSuchProp { name: full.into() }),
        }
    }

    /// Form a type references: the type itself or the nearest ancestor that
    /// names a form.
    pub fn form_of_type(&self, ty: &str) -> Option<&str> {
        let mut cursor = self.types.get(ty);
        while let Some(def) = cursor {
            if let Some(form) = self.forms.get(&def.name) {
                return Some(form.name.as_str());
            }
            cursor = def.parent.as_deref().and_then(|p| self.types.get(p));
        }
        None
    }

    /// Element type of an array type.
    pub fn array_elem(&self, ty: &str) -> Option<&str> {
        let def = self.types.get(ty)?;
        match def.base {
            Base::Array => def.opts.elem.as_deref(),
            _ => None,
        }
    }

    /// Whether values of `ty` are `(form, value)` references.
    pub fn is_ndef(&self, ty: &str) -> bool {
        self.types.get(ty).is_some_and(|def| def.base == Base::Ndef)
    }

    /// Whether a property is deprecated or relies on a deprecated type.
    pub fn prop_deprecated(&self, prop: &PropDef) -> bool {
        if prop.info.deprecated {
            return true;
        }
        let Some(def) = self.types.get(&prop.ty) else {
            return false;
        };
        if def.deprecated {
            return true;
        }
        def.opts
            .elem
            .as_deref()
            .and_then(|elem| self.types.get(elem))
            .is_some_and(|elem| elem.deprecated)
    }

    /// Whether a form or its primary type is deprecated.
    pub fn form_deprecated(&self, form: &FormDef) -> bool {
        form.info.deprecated || self.types.get(&form.name).is_some_and(|t| t.deprecated)
    }
}
