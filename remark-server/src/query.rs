use remark_api::CommentFilter;

pub enum Bind {
    Int(i64),
    String(String),
}

#[derive(Default)]
pub struct Sql {
    pub where_clause: String,
    pub binds: Vec<Bind>,
}

impl Sql {
    /// Adds a Bind, returning the index that should be used to refer to it assuming the first bind is at index first_bind_idx
    fn add_bind(&mut self, first_bind_idx: usize, b: Bind) -> usize {
        let res = first_bind_idx + self.binds.len();
        self.binds.push(b);
        res
    }

    fn and(&mut self, clause: &str) {
        self.where_clause.push_str(" AND ");
        self.where_clause.push_str(clause);
    }

    fn and_eq(&mut self, first_bind_idx: usize, column: &str, b: Bind) {
        let idx = self.add_bind(first_bind_idx, b);
        self.and(&format!("{column} = ${idx}"));
    }

    /// Applies the binds, in order, to a query built from this where clause
    pub fn bind_to<'q>(
        self,
        mut q: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    ) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
        for b in self.binds {
            q = match b {
                Bind::Int(i) => q.bind(i),
                Bind::String(s) => q.bind(s),
            };
        }
        q
    }
}

/// Assumes table c (comments) is available
pub fn to_postgres(f: &CommentFilter, first_bind_idx: usize) -> Sql {
    let mut res = Sql {
        where_clause: String::from("(true"),
        binds: Vec::new(),
    };
    if !f.include_deleted {
        res.and("c.is_deleted = false");
    }
    if let Some(collection) = &f.target_collection {
        res.and_eq(
            first_bind_idx,
            "c.target_collection",
            Bind::String(collection.clone()),
        );
    }
    if let Some(id) = &f.target_id {
        res.and_eq(first_bind_idx, "c.target_id", Bind::String(id.clone()));
    }
    if let Some(author) = f.author_id {
        res.and_eq(first_bind_idx, "c.author_id", Bind::Int(author.0));
    }
    if let Some(parent) = f.parent_id {
        res.and_eq(first_bind_idx, "c.parent_id", Bind::Int(parent.0));
    }
    if let Some(kind) = f.kind {
        res.and_eq(first_bind_idx, "c.type", Bind::String(String::from(kind.as_str())));
    }
    res.where_clause.push(')');
    res
}
