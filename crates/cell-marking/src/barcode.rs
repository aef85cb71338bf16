//! Barcode text rendering from the configured field template.

use crate::serial::SerialCounter;
use cell_common::{FieldTemplate, MarkingRecord, ShiftTable, TemplateField};
use chrono::{DateTime, Datelike, Local};

/// Inputs of one rendering besides the template.
#[derive(Debug, Clone, Copy)]
pub struct BarcodeContext<'a> {
    /// Marking time.
    pub now: DateTime<Local>,
    /// Shift lookup.
    pub shifts: &'a ShiftTable,
    /// Active part number.
    pub part_number: &'a str,
}

/// Result of a rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Barcode {
    /// Concatenated barcode text.
    pub text: String,
    /// Serial issued for this barcode.
    pub serial: String,
    /// Template fields with computed values filled in, in declaration order.
    pub fields: Vec<TemplateField>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Year,
    Month,
    Date,
    JulianDate,
    Shift,
    Serial,
    PartNumber,
    Model,
    Static,
}

impl Slot {
    fn of(name: &str) -> Self {
        const NAMES: [(&str, Slot); 10] = [
            ("Year", Slot::Year),
            ("Month", Slot::Month),
            ("Date", Slot::Date),
            ("Julian Date", Slot::JulianDate),
            ("Shift", Slot::Shift),
            ("Serial Number", Slot::Serial),
            ("Serial", Slot::Serial),
            ("Part Number", Slot::PartNumber),
            ("Model Number", Slot::Model),
            ("Model", Slot::Model),
        ];
        let name = name.trim();
        NAMES
            .iter()
            .find(|(label, _)| label.eq_ignore_ascii_case(name))
            .map_or(Slot::Static, |(_, slot)| *slot)
    }
}

/// Fill computed slots and join the checked fields by ascending `order`.
///
/// Fields with equal `order` keep their declaration order. Model fields never
/// contribute to the text; unknown names contribute their static value.
#[must_use]
pub fn compose(template: &FieldTemplate, ctx: &BarcodeContext<'_>, serial: &str) -> Barcode {
    let fields: Vec<TemplateField> = template
        .fields
        .iter()
        .map(|field| {
            let value = match Slot::of(&field.name) {
                Slot::Year => Some(ctx.now.format("%y").to_string()),
                Slot::Month => Some(ctx.now.format("%m").to_string()),
                Slot::Date => Some(ctx.now.format("%d").to_string()),
                Slot::JulianDate => Some(format!("{:03}", ctx.now.ordinal())),
                Slot::Shift => Some(ctx.shifts.shift_at(ctx.now.time()).to_string()),
                Slot::Serial => Some(serial.to_string()),
                Slot::PartNumber => Some(ctx.part_number.to_string()),
                Slot::Model | Slot::Static => field.value.clone(),
            };
            TemplateField {
                value,
                ..field.clone()
            }
        })
        .collect();

    let mut included: Vec<&TemplateField> = fields
        .iter()
        .filter(|f| f.checked && Slot::of(&f.name) != Slot::Model)
        .collect();
    included.sort_by_key(|f| f.order);
    let text = included
        .iter()
        .map(|f| f.value.as_deref().unwrap_or(""))
        .collect();

    Barcode {
        text,
        serial: serial.to_string(),
        fields,
    }
}

/// Issue the next serial and render the barcode around it.
pub fn render_barcode(
    template: &FieldTemplate,
    ctx: &BarcodeContext<'_>,
    counter: &mut SerialCounter,
    latest: Option<&MarkingRecord>,
) -> Barcode {
    let serial = counter.next_serial(ctx.now, latest);
    compose(template, ctx, &serial)
}

/// Content of the serial hand-off file: `ddMMyy` + infix + serial.
#[must_use]
pub fn serial_file_text(now: DateTime<Local>, infix: &str, serial: &str) -> String {
    format!("{}{infix}{serial}", now.format("%d%m%y"))
}
