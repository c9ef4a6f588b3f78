#[cfg(test)]
mod tests {
    use super::super::decoder::*;
    use super::super::test_utils::{users_builder, MockValue};
    use crate::event::{ChangeOperation, SequenceNumber, TableRef};
    use crate::Error;
    use serde_json::json;

    fn text(value: &str) -> MockValue {
        MockValue::text(value)
    }

    fn change(message: Option<DecodedMessage>) -> crate::event::CapturedChange {
        match message {
            Some(DecodedMessage::Change(change)) => change,
            other => panic!("expected a change, got {:?}", other),
        }
    }

    #[test]
    fn test_relation_is_cached() {
        let builder = users_builder(0x100);
        let mut decoder = PgOutputDecoder::new();

        assert_eq!(decoder.decode(&builder.relation_message(16384)).unwrap(), None);
        let relation = decoder.relation(16384).unwrap();
        assert_eq!(relation.table, TableRef::new("public", "users"));
        assert_eq!(relation.columns.len(), 3);
        assert!(relation.columns[0].is_key);
        assert!(!relation.columns[1].is_key);
    }

    #[test]
    fn test_changes_are_stamped_with_commit_lsn_and_ordinal() {
        let builder = users_builder(0x1_0000_0040);
        let mut decoder = PgOutputDecoder::new();

        assert_eq!(
            decoder.decode(&builder.begin_message(731)).unwrap(),
            Some(DecodedMessage::Begin {
                final_lsn: 0x1_0000_0040,
                xid: 731
            })
        );
        decoder.decode(&builder.relation_message(16384)).unwrap();

        let first = change(
            decoder
                .decode(&builder.insert_message(16384, vec![text("1"), text("Alice"), text("t")]))
                .unwrap(),
        );
        let second = change(
            decoder
                .decode(&builder.insert_message(16384, vec![text("2"), MockValue::Null, text("f")]))
                .unwrap(),
        );

        assert_eq!(first.op, ChangeOperation::Insert);
        assert_eq!(first.sequence, SequenceNumber::new(0x1_0000_0040, 0));
        assert_eq!(second.sequence, SequenceNumber::new(0x1_0000_0040, 1));
        assert_eq!(first.transaction_id, Some(731));
        assert_eq!(
            serde_json::Value::Object(first.after.unwrap()),
            json!({"id": 1, "name": "Alice", "active": true})
        );
        assert_eq!(second.after.unwrap()["name"], serde_json::Value::Null);

        assert_eq!(
            decoder.decode(&builder.commit_message()).unwrap(),
            Some(DecodedMessage::Commit {
                commit_lsn: 0x1_0000_0040
            })
        );
    }

    #[test]
    fn test_update_with_key_tuple_keeps_only_key_columns() {
        let builder = users_builder(0x200);
        let mut decoder = PgOutputDecoder::new();
        decoder.decode(&builder.begin_message(1)).unwrap();
        decoder.decode(&builder.relation_message(16384)).unwrap();

        let update = change(
            decoder
                .decode(&builder.update_message(
                    16384,
                    Some((true, vec![text("7"), MockValue::Null, MockValue::Null])),
                    vec![text("8"), text("Bob"), text("t")],
                ))
                .unwrap(),
        );
        assert_eq!(update.op, ChangeOperation::Update);
        assert_eq!(serde_json::Value::Object(update.before.unwrap()), json!({"id": 7}));
        assert_eq!(update.after.unwrap()["id"], 8);
    }

    #[test]
    fn test_update_fills_unchanged_toast_from_old_tuple() {
        let builder = users_builder(0x200);
        let mut decoder = PgOutputDecoder::new();
        decoder.decode(&builder.begin_message(1)).unwrap();
        decoder.decode(&builder.relation_message(16384)).unwrap();

        let update = change(
            decoder
                .decode(&builder.update_message(
                    16384,
                    Some((false, vec![text("3"), text("long text"), text("t")])),
                    vec![text("3"), MockValue::Unchanged, text("f")],
                ))
                .unwrap(),
        );
        let after = update.after.unwrap();
        assert_eq!(after["name"], "long text");
        assert_eq!(after["active"], false);
    }

    #[test]
    fn test_update_without_old_tuple() {
        let builder = users_builder(0x200);
        let mut decoder = PgOutputDecoder::new();
        decoder.decode(&builder.begin_message(1)).unwrap();
        decoder.decode(&builder.relation_message(16384)).unwrap();

        let update = change(
            decoder
                .decode(&builder.update_message(16384, None, vec![text("3"), text("C"), text("t")]))
                .unwrap(),
        );
        assert!(update.before.is_none());
    }

    #[test]
    fn test_delete_carries_key_image() {
        let builder = users_builder(0x300);
        let mut decoder = PgOutputDecoder::new();
        decoder.decode(&builder.begin_message(2)).unwrap();
        decoder.decode(&builder.relation_message(16384)).unwrap();

        let delete = change(
            decoder
                .decode(&builder.delete_message(16384, vec![text("5"), MockValue::Null, MockValue::Null]))
                .unwrap(),
        );
        assert_eq!(delete.op, ChangeOperation::Delete);
        assert!(delete.after.is_none());
        assert_eq!(serde_json::Value::Object(delete.before.unwrap()), json!({"id": 5}));
    }

    #[test]
    fn test_binary_values() {
        let builder = users_builder(0x300);
        let mut decoder = PgOutputDecoder::new();
        decoder.decode(&builder.begin_message(2)).unwrap();
        decoder.decode(&builder.relation_message(16384)).unwrap();

        let insert = change(
            decoder
                .decode(&builder.insert_message(
                    16384,
                    vec![
                        MockValue::Binary(42i32.to_be_bytes().to_vec()),
                        text("Dora"),
                        MockValue::Binary(vec![1]),
                    ],
                ))
                .unwrap(),
        );
        let after = insert.after.unwrap();
        assert_eq!(after["id"], 42);
        assert_eq!(after["active"], true);
    }

    #[test]
    fn test_truncate_lists_tables() {
        let builder = users_builder(0x300);
        let mut decoder = PgOutputDecoder::new();
        decoder.decode(&builder.relation_message(16384)).unwrap();

        assert_eq!(
            decoder.decode(&builder.truncate_message(vec![16384])).unwrap(),
            Some(DecodedMessage::Truncate(vec![TableRef::new("public", "users")]))
        );
    }

    #[test]
    fn test_unknown_relation_is_rejected() {
        let builder = users_builder(0x300);
        let mut decoder = PgOutputDecoder::new();
        decoder.decode(&builder.begin_message(2)).unwrap();

        let err = decoder
            .decode(&builder.insert_message(16384, vec![text("1"), text("x"), text("t")]))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidMessage { .. }));
    }

    #[test]
    fn test_change_outside_transaction_is_rejected() {
        let builder = users_builder(0x300);
        let mut decoder = PgOutputDecoder::new();
        decoder.decode(&builder.relation_message(16384)).unwrap();

        assert!(decoder
            .decode(&builder.insert_message(16384, vec![text("1"), text("x"), text("t")]))
            .is_err());
    }

    #[test]
    fn test_truncated_messages_are_errors_not_panics() {
        let builder = users_builder(0x300);
        let mut decoder = PgOutputDecoder::new();
        decoder.decode(&builder.begin_message(2)).unwrap();
        decoder.decode(&builder.relation_message(16384)).unwrap();

        let insert = builder.insert_message(16384, vec![text("1"), text("Alice"), text("t")]);
        for len in 1..insert.len() {
            assert!(decoder.decode(&insert[..len]).is_err(), "prefix of {} bytes", len);
        }
        assert!(decoder.decode(&builder.begin_message(2)[..10]).is_err());
        assert_eq!(decoder.decode(&[]).unwrap(), None);
    }

    #[test]
    fn test_column_count_mismatch() {
        let builder = users_builder(0x300);
        let mut decoder = PgOutputDecoder::new();
        decoder.decode(&builder.begin_message(2)).unwrap();
        decoder.decode(&builder.relation_message(16384)).unwrap();

        let err = decoder
            .decode(&builder.insert_message(16384, vec![text("1")]))
            .unwrap_err();
        assert!(err.to_string().contains("column count mismatch"));
    }
}
