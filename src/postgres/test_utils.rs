use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;

/// Builds raw pgoutput messages as returned by the peek functions.
pub struct MockMessageBuilder {
    lsn: u64,
    timestamp: i64,
    relations: HashMap<u32, MockRelation>,
}

#[derive(Debug, Clone)]
pub struct MockRelation {
    pub schema: String,
    pub table: String,
    pub columns: Vec<MockColumn>,
}

#[derive(Debug, Clone)]
pub struct MockColumn {
    pub name: String,
    pub type_id: u32,
    pub is_key: bool,
}

/// One column of a tuple.
#[derive(Debug, Clone)]
pub enum MockValue {
    Null,
    Unchanged,
    Text(String),
    Binary(Vec<u8>),
}

impl MockValue {
    pub fn text(value: &str) -> Self {
        MockValue::Text(value.to_string())
    }
}

impl From<Option<&str>> for MockValue {
    fn from(value: Option<&str>) -> Self {
        value.map(MockValue::text).unwrap_or(MockValue::Null)
    }
}

impl MockMessageBuilder {
    pub fn new() -> Self {
        Self {
            lsn: 0x0100_0000,
            timestamp: 1_697_369_400_000_000, // 2023-10-15 10:30:00 UTC in microseconds
            relations: HashMap::new(),
        }
    }

    pub fn with_lsn(mut self, lsn: u64) -> Self {
        self.lsn = lsn;
        self
    }

    pub fn add_relation(
        mut self,
        id: u32,
        schema: &str,
        table: &str,
        columns: Vec<(&str, u32, bool)>,
    ) -> Self {
        let columns = columns
            .into_iter()
            .map(|(name, type_id, is_key)| MockColumn {
                name: name.to_string(),
                type_id,
                is_key,
            })
            .collect();
        self.relations.insert(
            id,
            MockRelation {
                schema: schema.to_string(),
                table: table.to_string(),
                columns,
            },
        );
        self
    }

    pub fn begin_message(&self, xid: u32) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'B');
        buf.put_u64(self.lsn);
        buf.put_i64(self.timestamp);
        buf.put_u32(xid);
        buf.freeze()
    }

    pub fn commit_message(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'C');
        buf.put_u8(0);
        buf.put_u64(self.lsn);
        buf.put_u64(self.lsn + 0x28);
        buf.put_i64(self.timestamp);
        buf.freeze()
    }

    pub fn relation_message(&self, id: u32) -> Bytes {
        let relation = self
            .relations
            .get(&id)
            .expect("Relation not found. Use add_relation() first.");

        let mut buf = BytesMut::new();
        buf.put_u8(b'R');
        buf.put_u32(id);
        put_cstring(&mut buf, &relation.schema);
        put_cstring(&mut buf, &relation.table);
        buf.put_u8(b'd');
        buf.put_u16(relation.columns.len() as u16);
        for column in &relation.columns {
            buf.put_u8(u8::from(column.is_key));
            put_cstring(&mut buf, &column.name);
            buf.put_u32(column.type_id);
            buf.put_i32(-1);
        }
        buf.freeze()
    }

    pub fn insert_message(&self, id: u32, values: Vec<MockValue>) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'I');
        buf.put_u32(id);
        buf.put_u8(b'N');
        put_tuple(&mut buf, &values);
        buf.freeze()
    }

    /// `old` is sent as a key tuple ('K') when `key_only`, else as 'O'.
    pub fn update_message(
        &self,
        id: u32,
        old: Option<(bool, Vec<MockValue>)>,
        new: Vec<MockValue>,
    ) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'U');
        buf.put_u32(id);
        if let Some((key_only, old)) = old {
            buf.put_u8(if key_only { b'K' } else { b'O' });
            put_tuple(&mut buf, &old);
        }
        buf.put_u8(b'N');
        put_tuple(&mut buf, &new);
        buf.freeze()
    }

    pub fn delete_message(&self, id: u32, key: Vec<MockValue>) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'D');
        buf.put_u32(id);
        buf.put_u8(b'K');
        put_tuple(&mut buf, &key);
        buf.freeze()
    }

    pub fn truncate_message(&self, ids: Vec<u32>) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'T');
        buf.put_u32(ids.len() as u32);
        buf.put_u8(0);
        for id in ids {
            buf.put_u32(id);
        }
        buf.freeze()
    }
}

fn put_cstring(buf: &mut BytesMut, value: &str) {
    buf.put(value.as_bytes());
    buf.put_u8(0);
}

fn put_tuple(buf: &mut BytesMut, values: &[MockValue]) {
    buf.put_u16(values.len() as u16);
    for value in values {
        match value {
            MockValue::Null => buf.put_u8(b'n'),
            MockValue::Unchanged => buf.put_u8(b'u'),
            MockValue::Text(text) => {
                buf.put_u8(b't');
                buf.put_u32(text.len() as u32);
                buf.put(text.as_bytes());
            }
            MockValue::Binary(data) => {
                buf.put_u8(b'b');
                buf.put_u32(data.len() as u32);
                buf.put(data.as_slice());
            }
        }
    }
}

/// A `users(id int4 key, name text, active bool)` relation with id 16384.
pub fn users_builder(lsn: u64) -> MockMessageBuilder {
    MockMessageBuilder::new().with_lsn(lsn).add_relation(
        16384,
        "public",
        "users",
        vec![("id", 23, true), ("name", 25, false), ("active", 16, false)],
    )
}
