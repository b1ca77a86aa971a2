use crate::catalog;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCategory {
    Poison,
    Powerful,
    Narcotic,
    Stimulant,
    StimulantRawMaterial,
}

impl ControlCategory {
    pub const ALL: [ControlCategory; 5] = [
        ControlCategory::Poison,
        ControlCategory::Powerful,
        ControlCategory::Narcotic,
        ControlCategory::Stimulant,
        ControlCategory::StimulantRawMaterial,
    ];

    pub fn param(self) -> &'static str {
        match self {
            ControlCategory::Poison => "doyaku",
            ControlCategory::Powerful => "gekiyaku",
            ControlCategory::Narcotic => "mayaku",
            ControlCategory::Stimulant => "kakuseizai",
            ControlCategory::StimulantRawMaterial => "kakuseizaiGenryou",
        }
    }

    fn column(self) -> usize {
        match self {
            ControlCategory::Poison => catalog::JC_DOYAKU,
            ControlCategory::Powerful => catalog::JC_GEKIYAKU,
            ControlCategory::Narcotic => catalog::JC_MAYAKU,
            ControlCategory::Stimulant => catalog::JC_KAKUSEIZAI,
            ControlCategory::StimulantRawMaterial => catalog::JC_KAKUSEIZAI_GENRYOU,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregateFilters {
    pub name: Option<String>,
    pub categories: Vec<ControlCategory>,
    /// Psychotropic sub-classes, each in 1..=3.
    pub psychotropic: Vec<u8>,
}

impl AggregateFilters {
    /// Keeps only `1`, `2` and `3`, in first-seen order.
    pub fn with_psychotropic_list(mut self, raw: &str) -> Self {
        for part in raw.split(',').map(str::trim) {
            if let Ok(n @ 1..=3) = part.parse::<u8>() {
                if !self.psychotropic.contains(&n) {
                    self.psychotropic.push(n);
                }
            }
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WhereClause {
    pub sql: String,
    pub params: Vec<String>,
}

#[derive(Debug, Default)]
struct FilterBuilder {
    clauses: Vec<String>,
    params: Vec<String>,
}

impl FilterBuilder {
    fn push(&mut self, clause: String, params: impl IntoIterator<Item = String>) {
        self.clauses.push(clause);
        self.params.extend(params);
    }

    fn push_if<T>(&mut self, option: Option<T>, f: impl FnOnce(T) -> (String, Vec<String>)) {
        if let Some(value) = option {
            let (clause, params) = f(value);
            self.push(clause, params);
        }
    }

    fn finish(self) -> WhereClause {
        WhereClause {
            sql: format!("WHERE {}", self.clauses.join(" AND ")),
            params: self.params,
        }
    }
}

// Aliases: `t` transaction rows, `p` primary catalog, `m` canonical store.
pub fn build_where(from: &str, to: &str, filters: &AggregateFilters) -> WhereClause {
    let mut b = FilterBuilder::default();
    b.push(
        "t.date BETWEEN ? AND ?".to_string(),
        [from.to_string(), to.to_string()],
    );

    let name = filters
        .name
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty());
    b.push_if(name, |name| {
        let pattern = format!("%{name}%");
        (
            format!(
                "(COALESCE(p.jc{:03}, '') LIKE ? \
                 OR COALESCE(m.product_name, '') LIKE ? \
                 OR t.own_name LIKE ?)",
                catalog::JC_PRODUCT_NAME
            ),
            vec![pattern.clone(), pattern.clone(), pattern],
        )
    });

    for category in ControlCategory::ALL {
        let enabled = filters.categories.contains(&category).then_some(category);
        b.push_if(enabled, |c| {
            (format!("COALESCE(p.jc{:03}, '') = ?", c.column()), vec!["1".to_string()])
        });
    }

    let classes = (!filters.psychotropic.is_empty()).then_some(&filters.psychotropic);
    b.push_if(classes, |classes| {
        let marks = vec!["?"; classes.len()].join(", ");
        (
            format!("p.jc{:03} IN ({marks})", catalog::JC_KOUSEISHINYAKU),
            classes.iter().map(u8::to_string).collect(),
        )
    });

    b.finish()
}
