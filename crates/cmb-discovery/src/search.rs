//! Keyword search over tool names and descriptions.
//!
//! A small in-RAM tantivy index, rebuilt from the registry at startup and
//! after every live reload. Scoring is tantivy's default BM25.

use anyhow::{Context, Result};
use tantivy::{
    Index, IndexReader, ReloadPolicy, TantivyDocument,
    collector::TopDocs,
    doc,
    query::QueryParser,
    schema::{Field, STORED, Schema, TEXT, Value},
};

use cmb_upstream::ToolListEntry;

const WRITER_HEAP_BYTES: usize = 15_000_000;

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub entry: ToolListEntry,
    pub score: f32,
}

pub struct SearchIndex {
    index: Index,
    reader: IndexReader,
    field_server: Field,
    field_name: Field,
    field_description: Field,
}

impl SearchIndex {
    /// Build a fresh index over the given entries.
    pub fn build(entries: &[ToolListEntry]) -> Result<Self> {
        let mut schema_builder = Schema::builder();
        let field_server = schema_builder.add_text_field("server", TEXT | STORED);
        let field_name = schema_builder.add_text_field("name", TEXT | STORED);
        let field_description = schema_builder.add_text_field("description", TEXT | STORED);
        let schema = schema_builder.build();

        let index = Index::create_in_ram(schema);
        let mut writer = index
            .writer(WRITER_HEAP_BYTES)
            .context("failed to create search index writer")?;
        for entry in entries {
            writer
                .add_document(doc!(
                    field_server => entry.server.as_str(),
                    field_name => entry.name.as_str(),
                    field_description => entry.description.as_str(),
                ))
                .context("failed to index tool entry")?;
        }
        writer.commit().context("failed to commit search index")?;

        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()
            .context("failed to build search index reader")?;
        reader
            .reload()
            .context("failed to load committed search index")?;

        Ok(Self {
            index,
            reader,
            field_server,
            field_name,
            field_description,
        })
    }

    /// Top-`limit` entries ranked by BM25 over `{name, description}`.
    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        if query.trim().is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let parser =
            QueryParser::for_index(&self.index, vec![self.field_name, self.field_description]);
        // Lenient parsing: a stray '(' in the query must not become an error
        // response.
        let (parsed, _errors) = parser.parse_query_lenient(query);

        let searcher = self.reader.searcher();
        let top_docs = searcher
            .search(&parsed, &TopDocs::with_limit(limit))
            .context("search execution failed")?;

        let mut hits = Vec::with_capacity(top_docs.len());
        for (score, address) in top_docs {
            let doc: TantivyDocument = searcher
                .doc(address)
                .context("failed to load search hit")?;
            let get = |field: Field| {
                doc.get_first(field)
                    .and_then(|value| value.as_str())
                    .unwrap_or_default()
                    .to_string()
            };
            hits.push(SearchHit {
                entry: ToolListEntry {
                    server: get(self.field_server),
                    name: get(self.field_name),
                    description: get(self.field_description),
                },
                score,
            });
        }
        Ok(hits)
    }
}
