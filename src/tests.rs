// sysfile - reading and writing SPSS system files.
// Copyright (C) 2025 Free Software Foundation, Inc.
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, either version 3 of the License, or (at your option) any later
// version.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE.  See the GNU General Public License for more
// details.
//
// You should have received a copy of the GNU General Public License along with
// this program.  If not, see <http://www.gnu.org/licenses/>.

//! Whole-file tests: write with one half of the crate, read with the other.

use std::io::{Cursor, Write as _};

use binrw::BinWrite;
use chrono::NaiveDate;

use crate::{
    cooked::DataSet,
    data::{Datum, Value},
    dictionary::{Measure, Metadata, MissingValueRange, MissingValues, VarWidth, Variable},
    format::{Format, RawFormat, Type},
    raw::{
        self,
        records::{Compression, RawHeader, RawVariableRecord},
        ErrorDetails, RawWidth,
    },
    write::WriteOptions,
};

fn write_to_vec(data_set: &DataSet, options: WriteOptions) -> Vec<u8> {
    data_set
        .write_with_options(options, Cursor::new(Vec::new()))
        .unwrap()
        .into_inner()
}

fn read_back(bytes: Vec<u8>) -> DataSet {
    DataSet::read(Cursor::new(bytes)).unwrap()
}

fn round_trip(data_set: &DataSet, compression: Compression) -> DataSet {
    read_back(write_to_vec(
        data_set,
        WriteOptions::reproducible(compression),
    ))
}

#[test]
fn numeric_and_string_round_trip() {
    let mut score = Variable::new("score", VarWidth::Numeric).with_label("Test score");
    score
        .value_labels
        .insert(Datum::Number(Some(1.0)), "One".to_string());
    score
        .value_labels
        .insert(Datum::Number(Some(2.0)), "Two".to_string());
    score.missing_values =
        MissingValues::new(vec![Datum::Number(Some(9.0))], None).unwrap();
    score.measure = Measure::Scale;

    let mut grade = Variable::new("grade", VarWidth::String(2));
    grade
        .value_labels
        .insert(Datum::String("A".into()), "Excellent".to_string());

    let comment = Variable::new("comment", VarWidth::String(16));

    let metadata = Metadata::new(vec![score, grade, comment]);
    let data_set = DataSet {
        metadata,
        cases: vec![
            vec![Value::from(1.0), Value::from("A"), Value::from("fine")],
            vec![Value::Number(None), Value::from("B"), Value::from("")],
            vec![Value::from(-3.25), Value::from("C"), Value::from("needs more work")],
        ],
    };

    for compression in [Compression::Simple, Compression::ZLib] {
        let result = round_trip(&data_set, compression);
        assert_eq!(result.metadata.variables, data_set.metadata.variables);
        assert_eq!(result.metadata.bias, 100.0);
        assert_eq!(result.metadata.n_cases, Some(3));
        assert_eq!(result.cases, data_set.cases);
    }
}

#[test]
fn zsav_magic() {
    let metadata = Metadata::new(vec![Variable::new("x", VarWidth::Numeric)]);
    let data_set = DataSet {
        metadata,
        cases: vec![vec![Value::from(1.0)]],
    };
    let bytes = write_to_vec(&data_set, WriteOptions::reproducible(Compression::ZLib));
    assert_eq!(&bytes[..4], b"$FL3");
    assert_eq!(read_back(bytes).cases, data_set.cases);
}

/// Values crossing the `code = value + bias` boundaries: codes 0 and 252
/// must be written raw, codes 1 through 251 as a single byte, and either
/// way the values must come back exactly.
#[test]
fn compression_boundary_cases() {
    for bias in [0.0, 100.0] {
        let mut metadata = Metadata::new(vec![Variable::new("v", VarWidth::Numeric)]);
        metadata.bias = bias;
        let values = [
            0.0 - bias,
            1.0 - bias,
            250.0 - bias,
            251.0 - bias,
            252.0 - bias,
            5.3,
            -1.5,
            1e100,
        ];
        let mut cases: Vec<Vec<Value>> =
            values.iter().map(|v| vec![Value::from(*v)]).collect();
        cases.push(vec![Value::Number(None)]);

        let data_set = DataSet { metadata, cases };
        let result = round_trip(&data_set, Compression::Simple);
        assert_eq!(result.cases, data_set.cases, "bias {bias}");
    }
}

fn single_column_file(variable: Variable, value: Value) -> Vec<u8> {
    let data_set = DataSet {
        metadata: Metadata::new(vec![variable]),
        cases: vec![vec![value]],
    };
    write_to_vec(&data_set, WriteOptions::reproducible(Compression::Simple))
}

/// Writing 5.0 with bias 100 must encode as the single instruction byte
/// 0x69 (105) with no raw payload.
#[test]
fn integer_compresses_to_one_byte() {
    let bytes = single_column_file(Variable::new("v", VarWidth::Numeric), Value::from(5.0));
    assert_eq!(&bytes[bytes.len() - 8..], &[0x69, 0, 0, 0, 0, 0, 0, 0]);
}

/// Writing 5.3 must encode as instruction byte 253 followed by the raw
/// 8-byte IEEE-754 bit pattern.
#[test]
fn fraction_writes_raw_cell() {
    let bytes = single_column_file(Variable::new("v", VarWidth::Numeric), Value::from(5.3));
    let tail = &bytes[bytes.len() - 16..];
    assert_eq!(&tail[..8], &[253, 0, 0, 0, 0, 0, 0, 0]);
    assert_eq!(&tail[8..], &5.3f64.to_le_bytes());
}

/// An 8-byte string holding "AB" encodes as one chunk "AB      " tagged 253.
#[test]
fn short_string_pads_with_spaces() {
    let bytes = single_column_file(Variable::new("s", VarWidth::String(8)), Value::from("AB"));
    let tail = &bytes[bytes.len() - 16..];
    assert_eq!(&tail[..8], &[253, 0, 0, 0, 0, 0, 0, 0]);
    assert_eq!(&tail[8..], b"AB      ");
}

/// A 16-byte string holding "AB" encodes its all-spaces second chunk as code
/// 254 with no raw payload.
#[test]
fn space_chunk_compresses_to_one_byte() {
    let bytes = single_column_file(Variable::new("s", VarWidth::String(16)), Value::from("AB"));
    let tail = &bytes[bytes.len() - 16..];
    assert_eq!(&tail[..8], &[253, 254, 0, 0, 0, 0, 0, 0]);
    assert_eq!(&tail[8..], b"AB      ");
}

/// A 1000-byte string splits into 4 segments (255+255+255+244 wide) backed
/// by 127 variable records total, and reassembles on read.
#[test]
fn very_long_string_segmentation() {
    let value: String = "a".repeat(300) + &" ".repeat(16) + &"b".repeat(200);
    let data_set = DataSet {
        metadata: Metadata::new(vec![
            Variable::new("longstr", VarWidth::String(1000)),
            Variable::new("n", VarWidth::Numeric),
        ]),
        cases: vec![
            vec![Value::String(value.clone()), Value::from(1.0)],
            vec![Value::from(""), Value::from(2.0)],
        ],
    };
    let bytes = write_to_vec(&data_set, WriteOptions::reproducible(Compression::Simple));

    // Count raw variable records: 4 named segment records plus one
    // continuation per extra 8-byte chunk, 127 in all, then one more for the
    // numeric variable.
    let mut reader = raw::Reader::new(Cursor::new(bytes.clone()), |_| ()).unwrap();
    let records: Vec<_> = reader.records().collect::<Result<_, _>>().unwrap();
    let variable_records = records
        .iter()
        .filter(|record| matches!(record, raw::Record::Variable(_)))
        .count();
    let named_records = records
        .iter()
        .filter(|record| {
            matches!(record, raw::Record::Variable(v) if v.width != RawWidth::Continuation)
        })
        .count();
    assert_eq!(variable_records, 127 + 1);
    assert_eq!(named_records, 4 + 1);

    let result = read_back(bytes);
    assert_eq!(result.metadata.variables.len(), 2);
    assert_eq!(result.metadata.variables[0].width, VarWidth::String(1000));
    assert_eq!(result.metadata.variables[0].name, "longstr");
    assert_eq!(result.cases, data_set.cases);
}

#[test]
fn missing_value_kinds_round_trip() {
    let kinds: Vec<MissingValues> = vec![
        MissingValues::default(),
        MissingValues::new(vec![Datum::Number(Some(9.0))], None).unwrap(),
        MissingValues::new(
            vec![Datum::Number(Some(8.0)), Datum::Number(Some(9.0))],
            None,
        )
        .unwrap(),
        MissingValues::new(
            vec![
                Datum::Number(Some(7.0)),
                Datum::Number(Some(8.0)),
                Datum::Number(Some(9.0)),
            ],
            None,
        )
        .unwrap(),
        MissingValues::new(
            vec![],
            Some(MissingValueRange::In {
                low: 90.0,
                high: 99.0,
            }),
        )
        .unwrap(),
        MissingValues::new(
            vec![Datum::Number(Some(0.0))],
            Some(MissingValueRange::From { low: 100.0 }),
        )
        .unwrap(),
        MissingValues::new(vec![], Some(MissingValueRange::To { high: -1.0 })).unwrap(),
    ];
    let variables = kinds
        .iter()
        .enumerate()
        .map(|(index, missing_values)| {
            Variable::new(format!("v{index}"), VarWidth::Numeric)
                .with_missing_values(missing_values.clone())
        })
        .collect();

    let data_set = DataSet {
        metadata: Metadata::new(variables),
        cases: vec![(0..kinds.len()).map(|_| Value::from(1.0)).collect()],
    };
    let result = round_trip(&data_set, Compression::Simple);
    for (variable, expected) in result.metadata.variables.iter().zip(kinds.iter()) {
        assert_eq!(&variable.missing_values, expected, "{}", variable.name);
    }

    // Sentinels filter as missing; values just outside a range boundary are
    // present.
    let range = &result.metadata.variables[4].missing_values;
    assert!(range.contains(&Datum::Number(Some(90.0))));
    assert!(range.contains(&Datum::Number(Some(99.0))));
    assert!(!range.contains(&Datum::Number(Some(89.999))));
    assert!(!range.contains(&Datum::Number(Some(99.001))));

    let range_plus = &result.metadata.variables[5].missing_values;
    assert!(range_plus.contains(&Datum::Number(Some(0.0))));
    assert!(range_plus.contains(&Datum::Number(Some(100.0))));
    assert!(!range_plus.contains(&Datum::Number(Some(99.999))));
}

#[test]
fn string_missing_values_round_trip() {
    let short = Variable::new("code", VarWidth::String(4)).with_missing_values(
        MissingValues::new(
            vec![Datum::String("NA".into()), Datum::String("??".into())],
            None,
        )
        .unwrap(),
    );
    // Wider than 8 bytes, so missing values travel in their own record.
    let long = Variable::new("reason", VarWidth::String(40)).with_missing_values(
        MissingValues::new(vec![Datum::String("unknown".into())], None).unwrap(),
    );

    let data_set = DataSet {
        metadata: Metadata::new(vec![short, long]),
        cases: vec![vec![Value::from("NA"), Value::from("did not answer")]],
    };
    let result = round_trip(&data_set, Compression::Simple);
    assert_eq!(result.metadata.variables, data_set.metadata.variables);
    assert_eq!(result.cases, data_set.cases);
}

#[test]
fn long_string_value_labels_round_trip() {
    let mut wide = Variable::new("essay", VarWidth::String(300));
    wide.value_labels
        .insert(Datum::String("none".into()), "No answer given".to_string());

    let data_set = DataSet {
        metadata: Metadata::new(vec![wide]),
        cases: vec![vec![Value::from("none")]],
    };
    let result = round_trip(&data_set, Compression::Simple);
    assert_eq!(
        result.metadata.variables[0].value_labels,
        data_set.metadata.variables[0].value_labels
    );
}

#[test]
fn long_variable_names_round_trip() {
    // Both names truncate to the same 8-byte short name, so the second falls
    // back to the generated pattern; the long name record restores both.
    let data_set = DataSet {
        metadata: Metadata::new(vec![
            Variable::new("customer_id", VarWidth::Numeric),
            Variable::new("customer_name", VarWidth::String(24)),
        ]),
        cases: vec![vec![Value::from(1.0), Value::from("somebody")]],
    };
    let result = round_trip(&data_set, Compression::Simple);
    assert_eq!(result.metadata.variables[0].name, "customer_id");
    assert_eq!(result.metadata.variables[1].name, "customer_name");
    assert_eq!(result.cases, data_set.cases);
}

#[test]
fn documents_round_trip() {
    let mut metadata = Metadata::new(vec![Variable::new("x", VarWidth::Numeric)]);
    metadata.documents = vec!["Line one".to_string(), "Line two".to_string()];
    let data_set = DataSet {
        metadata,
        cases: vec![vec![Value::from(0.0)]],
    };
    let result = round_trip(&data_set, Compression::Simple);
    assert_eq!(result.metadata.documents, data_set.metadata.documents);
}

#[test]
fn dates_round_trip() {
    let when = NaiveDate::from_ymd_opt(2020, 5, 17)
        .unwrap()
        .and_hms_opt(8, 30, 0)
        .unwrap();
    let variable =
        Variable::new("when", VarWidth::Numeric).with_format(Format::new(Type::DateTime, 20, 0));
    let data_set = DataSet {
        metadata: Metadata::new(vec![variable]),
        cases: vec![vec![Value::from(when)], vec![Value::DateTime(None)]],
    };
    let result = round_trip(&data_set, Compression::Simple);
    assert_eq!(result.cases, data_set.cases);
    assert_eq!(
        result.metadata.variables[0].format.type_(),
        Type::DateTime
    );
}

/// A byte-swapped file reads identically to its native-endian counterpart
/// once the layout code flips the cursor's interpretation.
#[test]
fn big_endian_file() {
    let mut cursor = Cursor::new(Vec::new());
    RawHeader {
        magic: *b"$FL2",
        eye_catcher: [b' '; 60],
        layout_code: 2,
        nominal_case_size: 1,
        compression_code: 1,
        weight_index: 0,
        n_cases: 2,
        bias: 100.0,
        creation_date: *b"01 Jan 24",
        creation_time: *b"12:00:00",
        file_label: [b' '; 64],
    }
    .write_be(&mut cursor)
    .unwrap();

    (
        2u32,
        RawVariableRecord {
            width: 0,
            has_variable_label: 0,
            missing_value_code: 0,
            print_format: RawFormat(0x00050800),
            write_format: RawFormat(0x00050800),
            name: *b"X       ",
        },
    )
        .write_be(&mut cursor)
        .unwrap();

    // Value labels: the raw 8-byte value must be interpreted through the
    // file's byte order.
    (3u32, 1u32).write_be(&mut cursor).unwrap();
    1.0f64.write_be(&mut cursor).unwrap();
    (3u8, *b"One", [0u8; 4]).write_be(&mut cursor).unwrap();
    (4u32, 1u32, 1u32).write_be(&mut cursor).unwrap();

    (999u32, 0u32).write_be(&mut cursor).unwrap();

    // Two cases: 5.0 compressed against the bias, 5.3 as a raw big-endian
    // cell.
    cursor
        .write_all(&[105, 253, 252, 0, 0, 0, 0, 0])
        .unwrap();
    cursor.write_all(&5.3f64.to_be_bytes()).unwrap();

    let result = read_back(cursor.into_inner());
    assert_eq!(result.metadata.variables.len(), 1);
    assert_eq!(result.metadata.variables[0].name, "X");
    assert_eq!(
        result.metadata.variables[0]
            .value_labels
            .get(&Datum::Number(Some(1.0)))
            .map(String::as_str),
        Some("One")
    );
    assert_eq!(
        result.cases,
        vec![vec![Value::from(5.0)], vec![Value::from(5.3)]]
    );
}

#[test]
fn rejects_uncompressed_files() {
    let mut cursor = Cursor::new(Vec::new());
    RawHeader {
        magic: *b"$FL2",
        eye_catcher: [b' '; 60],
        layout_code: 2,
        nominal_case_size: 1,
        compression_code: 0,
        weight_index: 0,
        n_cases: 0,
        bias: 100.0,
        creation_date: *b"01 Jan 24",
        creation_time: *b"12:00:00",
        file_label: [b' '; 64],
    }
    .write_le(&mut cursor)
    .unwrap();

    let error = DataSet::read(Cursor::new(cursor.into_inner())).unwrap_err();
    assert!(matches!(
        error,
        crate::cooked::Error::Raw(raw::Error {
            details: ErrorDetails::UnsupportedCompression(0),
            ..
        })
    ));
}

#[test]
fn rejects_ebcdic_files() {
    let mut bytes = vec![0x5b, 0xc6, 0xd3, 0xf2];
    bytes.resize(176, 0);
    let error = DataSet::read(Cursor::new(bytes)).unwrap_err();
    assert!(matches!(
        error,
        crate::cooked::Error::Raw(raw::Error {
            details: ErrorDetails::UnsupportedEncoding,
            ..
        })
    ));
}

#[test]
fn rejects_truncated_file() {
    let error = DataSet::read(Cursor::new(b"$FL2".to_vec())).unwrap_err();
    assert!(matches!(
        error,
        crate::cooked::Error::Raw(raw::Error {
            details: ErrorDetails::NotASystemFile,
            ..
        })
    ));
}

/// Unknown top-level record types are fatal; their boundaries can't be
/// inferred.  The error carries the offset where it was detected.
#[test]
fn rejects_unknown_record_type() {
    let data_set = DataSet {
        metadata: Metadata::new(vec![Variable::new("x", VarWidth::Numeric)]),
        cases: vec![],
    };
    let mut bytes = write_to_vec(&data_set, WriteOptions::reproducible(Compression::Simple));
    // Overwrite the variable record's type word with garbage.
    bytes[176..180].copy_from_slice(&12345u32.to_le_bytes());

    let error = DataSet::read(Cursor::new(bytes)).unwrap_err();
    match error {
        crate::cooked::Error::Raw(raw::Error {
            details: ErrorDetails::UnknownRecordType(12345),
            offsets: Some(offsets),
        }) => assert_eq!(offsets, 176..180),
        other => panic!("unexpected error {other}"),
    }
}

/// Unrecognized info subtypes are skipped by declared size, with a warning,
/// and reading carries on.
#[test]
fn skips_unknown_info_subtype() {
    let data_set = DataSet {
        metadata: Metadata::new(vec![Variable::new("x", VarWidth::Numeric)]),
        cases: vec![vec![Value::from(1.0)]],
    };
    let bytes = write_to_vec(&data_set, WriteOptions::reproducible(Compression::Simple));

    // Splice an unknown subtype-99 info record in front of the end record.
    let end_marker: Vec<u8> = [999u32, 0u32]
        .iter()
        .flat_map(|n| n.to_le_bytes())
        .collect();
    let end = bytes
        .windows(8)
        .position(|window| window == end_marker)
        .unwrap();
    let mut spliced = bytes[..end].to_vec();
    for word in [7u32, 99, 1, 4] {
        spliced.extend_from_slice(&word.to_le_bytes());
    }
    spliced.extend_from_slice(b"junk");
    spliced.extend_from_slice(&bytes[end..]);

    let mut warnings = Vec::new();
    let result = DataSet::read_with_warnings(Cursor::new(spliced), |warning| {
        warnings.push(warning.to_string())
    })
    .unwrap();
    assert_eq!(result.cases, data_set.cases);
    assert!(warnings
        .iter()
        .any(|warning| warning.contains("subtype 99")));
}

#[test]
fn empty_zsav_has_no_blocks() {
    let data_set = DataSet {
        metadata: Metadata::new(vec![Variable::new("x", VarWidth::Numeric)]),
        cases: vec![],
    };
    let result = round_trip(&data_set, Compression::ZLib);
    assert!(result.cases.is_empty());
    assert_eq!(result.metadata.n_cases, Some(0));
}

#[test]
fn bias_zero_round_trip() {
    let mut metadata = Metadata::new(vec![Variable::new("v", VarWidth::Numeric)]);
    metadata.bias = 0.0;
    let data_set = DataSet {
        metadata,
        cases: (1..=10).map(|i| vec![Value::from(i as f64)]).collect(),
    };
    let result = round_trip(&data_set, Compression::Simple);
    assert_eq!(result.metadata.bias, 0.0);
    assert_eq!(result.cases, data_set.cases);
}

#[test]
fn label_truncation() {
    let long_label = "x".repeat(400);
    let variable = Variable::new("v", VarWidth::Numeric).with_label(&long_label);
    let data_set = DataSet {
        metadata: Metadata::new(vec![variable]),
        cases: vec![vec![Value::from(1.0)]],
    };
    let result = round_trip(&data_set, Compression::Simple);
    assert_eq!(
        result.metadata.variables[0].label.as_deref(),
        Some(&long_label[..254])
    );
}
