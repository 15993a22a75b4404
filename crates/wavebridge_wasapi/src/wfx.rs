//! WAVEFORMATEX Bridging and Format Probing
//!
//! Converts between the OS wave-format structures and the core format model,
//! reads endpoint property stores, and probes the format sets an endpoint
//! accepts in shared and exclusive mode.

use wavebridge_core::compare::sort_formats;
use wavebridge_core::format::{
    SubFormat, WaveFormat, FORMAT_TAG_EXTENSIBLE, FORMAT_TAG_IEEE_FLOAT, FORMAT_TAG_PCM,
};

use crate::hresult;

use windows::core::GUID;
use windows::Win32::Media::Audio::{
    IAudioClient, AUDCLNT_SHAREMODE_EXCLUSIVE, WAVEFORMATEX, WAVEFORMATEXTENSIBLE,
};
use windows::Win32::System::Com::CoTaskMemFree;
use windows::Win32::UI::Shell::PropertiesSystem::{IPropertyStore, PROPERTYKEY};

/// PKEY_Device_FriendlyName = {a45c254e-df1c-4efd-8020-67d146a850e0}, 14
pub const PKEY_DEVICE_FRIENDLY_NAME: PROPERTYKEY = PROPERTYKEY {
    fmtid: GUID::from_u128(0xa45c254e_df1c_4efd_8020_67d146a850e0),
    pid: 14,
};

/// PKEY_Device_EnumeratorName = {a45c254e-df1c-4efd-8020-67d146a850e0}, 24
pub const PKEY_DEVICE_ENUMERATOR_NAME: PROPERTYKEY = PROPERTYKEY {
    fmtid: GUID::from_u128(0xa45c254e_df1c_4efd_8020_67d146a850e0),
    pid: 24,
};

/// PKEY_AudioEndpoint_FormFactor = {1da5d803-d492-4edd-8c23-e0c0ffee7f0e}, 0
pub const PKEY_AUDIO_ENDPOINT_FORM_FACTOR: PROPERTYKEY = PROPERTYKEY {
    fmtid: GUID::from_u128(0x1da5d803_d492_4edd_8c23_e0c0ffee7f0e),
    pid: 0,
};

/// PKEY_AudioEngine_DeviceFormat = {f19f064d-082c-4e27-bc73-6882a1bb8e4c}, 0
pub const PKEY_AUDIO_ENGINE_DEVICE_FORMAT: PROPERTYKEY = PROPERTYKEY {
    fmtid: GUID::from_u128(0xf19f064d_082c_4e27_bc73_6882a1bb8e4c),
    pid: 0,
};

const VT_BLOB: u16 = 65;
const VT_UI4: u16 = 19;
const VT_LPWSTR: u16 = 31;

/// Extensible payload size past the WAVEFORMATEX header
const EXTENSIBLE_CB_SIZE: u16 =
    (std::mem::size_of::<WAVEFORMATEXTENSIBLE>() - std::mem::size_of::<WAVEFORMATEX>()) as u16;

/// Owned OS-layout format built from the core model
///
/// Always materialised as WAVEFORMATEXTENSIBLE storage; plain tags just use
/// the leading WAVEFORMATEX part with `cbSize = 0`.
pub struct RawFormat(WAVEFORMATEXTENSIBLE);

impl RawFormat {
    pub fn from_wave(wf: &WaveFormat) -> RawFormat {
        // SAFETY: all-zero is a valid WAVEFORMATEXTENSIBLE
        let mut ext: WAVEFORMATEXTENSIBLE = unsafe { std::mem::zeroed() };
        ext.Format.wFormatTag = wf.tag;
        ext.Format.nChannels = wf.channels;
        ext.Format.nSamplesPerSec = wf.rate;
        ext.Format.wBitsPerSample = wf.bits_per_sample;
        ext.Format.nBlockAlign = wf.block_align() as u16;
        ext.Format.nAvgBytesPerSec = wf.avg_bytes_per_sec();

        if wf.is_extensible() {
            ext.Format.cbSize = EXTENSIBLE_CB_SIZE;
            ext.Samples.wValidBitsPerSample = wf.valid_bits_per_sample;
            ext.dwChannelMask = wf.channel_mask;
            ext.SubFormat = GUID::from_u128(wf.sub_format.0);
        }

        RawFormat(ext)
    }

    pub fn as_ptr(&self) -> *const WAVEFORMATEX {
        &self.0 as *const WAVEFORMATEXTENSIBLE as *const WAVEFORMATEX
    }
}

/// Read an OS wave format into the core model
///
/// # Safety
///
/// `ptr` must point at a valid WAVEFORMATEX with `cbSize` trailing bytes.
pub unsafe fn from_waveformatex(ptr: *const WAVEFORMATEX) -> Option<WaveFormat> {
    if ptr.is_null() {
        return None;
    }

    let base = std::ptr::read_unaligned(ptr);
    let mut wf = WaveFormat {
        tag: base.wFormatTag,
        channels: base.nChannels,
        rate: base.nSamplesPerSec,
        bits_per_sample: base.wBitsPerSample,
        valid_bits_per_sample: base.wBitsPerSample,
        channel_mask: 0,
        sub_format: SubFormat::NONE,
    };

    match base.wFormatTag {
        FORMAT_TAG_PCM => wf.sub_format = SubFormat::PCM,
        FORMAT_TAG_IEEE_FLOAT => wf.sub_format = SubFormat::IEEE_FLOAT,
        FORMAT_TAG_EXTENSIBLE if base.cbSize >= EXTENSIBLE_CB_SIZE => {
            let ext = std::ptr::read_unaligned(ptr as *const WAVEFORMATEXTENSIBLE);
            wf.valid_bits_per_sample = ext.Samples.wValidBitsPerSample;
            wf.channel_mask = ext.dwChannelMask;
            wf.sub_format = SubFormat(ext.SubFormat.to_u128());
        }
        _ => return None,
    }

    Some(wf)
}

/// Read, convert and free a CoTaskMem-allocated format
///
/// # Safety
///
/// `ptr` must come from a WASAPI out parameter (CoTaskMemAlloc) or be null.
pub unsafe fn take_waveformatex(ptr: *mut WAVEFORMATEX) -> Option<WaveFormat> {
    if ptr.is_null() {
        return None;
    }
    let wf = from_waveformatex(ptr);
    CoTaskMemFree(Some(ptr as *const _));
    wf
}

/// Mix format of a client, when it reports one
pub fn mix_format(client: &IAudioClient) -> Option<WaveFormat> {
    // SAFETY: GetMixFormat hands over a CoTaskMem allocation we free
    unsafe {
        match client.GetMixFormat() {
            Ok(ptr) => take_waveformatex(ptr),
            Err(e) => {
                tracing::debug!("GetMixFormat failed: {e}");
                None
            }
        }
    }
}

/// Shared-mode format set: the engine mix format
pub fn shared_mode_formats(client: &IAudioClient) -> Vec<WaveFormat> {
    mix_format(client).into_iter().collect()
}

/// Raw PROPVARIANT layout for reading VT_BLOB / VT_UI4 / VT_LPWSTR values
/// without version-sensitive helpers (x64: BLOB data pointer at offset 16)
fn propvariant_vt(prop: &windows::core::PROPVARIANT) -> u16 {
    let ptr = prop as *const _ as *const u16;
    // SAFETY: vt is the first field of the C layout
    unsafe { *ptr }
}

fn propvariant_blob(prop: &windows::core::PROPVARIANT) -> Option<&[u8]> {
    if propvariant_vt(prop) != VT_BLOB {
        return None;
    }
    let base = prop as *const _ as *const u8;
    // SAFETY: VT_BLOB layout is vt(2) pad(6) cbSize(4) pad(4) pBlobData(8)
    unsafe {
        let size = *(base.add(8) as *const u32) as usize;
        let data = *(base.add(16) as *const *const u8);
        if data.is_null() || size == 0 {
            return None;
        }
        Some(std::slice::from_raw_parts(data, size))
    }
}

/// UI4 property value
pub fn property_u32(store: &IPropertyStore, key: &PROPERTYKEY) -> Option<u32> {
    // SAFETY: GetValue returns an owned PROPVARIANT
    let prop = unsafe { store.GetValue(key) }.ok()?;
    if propvariant_vt(&prop) != VT_UI4 {
        return None;
    }
    let base = &prop as *const _ as *const u8;
    // SAFETY: ulVal lives at offset 8 of the C layout
    Some(unsafe { *(base.add(8) as *const u32) })
}

/// LPWSTR property value
pub fn property_string(store: &IPropertyStore, key: &PROPERTYKEY) -> Option<String> {
    // SAFETY: GetValue returns an owned PROPVARIANT
    let prop = unsafe { store.GetValue(key) }.ok()?;
    if propvariant_vt(&prop) != VT_LPWSTR {
        return None;
    }
    let text = prop.to_string();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Device format advertised in the endpoint property store
pub fn property_store_device_format(store: &IPropertyStore) -> Option<WaveFormat> {
    // SAFETY: GetValue returns an owned PROPVARIANT; blob bytes stay valid
    // while `prop` lives
    let prop = unsafe { store.GetValue(&PKEY_AUDIO_ENGINE_DEVICE_FORMAT) }.ok()?;
    let blob = propvariant_blob(&prop)?;
    if blob.len() < std::mem::size_of::<WAVEFORMATEX>() {
        return None;
    }
    // SAFETY: blob checked to hold at least a WAVEFORMATEX
    unsafe { from_waveformatex(blob.as_ptr() as *const WAVEFORMATEX) }
}

/// Exclusive-mode probe: IsFormatSupported for one candidate
///
/// `S_OK` keeps the candidate, `S_FALSE` keeps the suggested closest match.
fn probe_exclusive(client: &IAudioClient, candidate: &WaveFormat) -> Option<WaveFormat> {
    let raw = RawFormat::from_wave(candidate);
    let mut closest: *mut WAVEFORMATEX = std::ptr::null_mut();

    // SAFETY: candidate storage outlives the call; closest freed by take
    let hr = unsafe {
        client.IsFormatSupported(AUDCLNT_SHAREMODE_EXCLUSIVE, raw.as_ptr(), Some(&mut closest))
    };

    if hr.0 == hresult::S_OK {
        // SAFETY: free a possibly-set closest pointer anyway
        unsafe { take_waveformatex(closest) };
        Some(*candidate)
    } else if hr.0 == hresult::S_FALSE {
        // SAFETY: S_FALSE hands back a closest-match allocation
        unsafe { take_waveformatex(closest) }
    } else {
        None
    }
}

/// Exclusive-mode format set
///
/// Seeds with the property-store device format, then walks a fixed
/// depth x rate x channel grid, collecting accepted formats and suggested
/// closest matches. The result is sorted by similarity to the basis (the
/// accepted device format, else the first hit, else the default mix format).
pub fn exclusive_mode_formats(client: &IAudioClient, store: &IPropertyStore) -> Vec<WaveFormat> {
    let mut list: Vec<WaveFormat> = Vec::new();
    let mut basis: Option<WaveFormat> = None;

    if let Some(device_format) = property_store_device_format(store) {
        if let Some(hit) = probe_exclusive(client, &device_format) {
            basis = Some(hit);
            list.push(hit);
        }
    }

    struct DepthPair {
        bits: u16,
        valid_bits: u16,
        is_float: bool,
    }

    const DEPTH_PAIRS: &[DepthPair] = &[
        DepthPair { bits: 32, valid_bits: 32, is_float: true },
        DepthPair { bits: 32, valid_bits: 32, is_float: false },
        DepthPair { bits: 24, valid_bits: 24, is_float: false },
        DepthPair { bits: 16, valid_bits: 16, is_float: false },
        DepthPair { bits: 32, valid_bits: 24, is_float: false },
    ];
    const RATES: &[u32] = &[192000, 176400, 96000, 88200, 48000, 44100];
    const CHANNELS: &[u16] = &[8, 6, 2, 1];

    for &rate in RATES {
        for &ch in CHANNELS {
            for pair in DEPTH_PAIRS {
                let candidate =
                    WaveFormat::extensible(ch, rate, pair.bits, pair.valid_bits, pair.is_float);
                if let Some(hit) = probe_exclusive(client, &candidate) {
                    list.push(hit);
                }
            }
        }
    }

    let basis = basis
        .or_else(|| list.first().copied())
        .unwrap_or_else(WaveFormat::default_mix);

    sort_formats(&mut list, &basis);
    list
}

/// Convert a PWSTR out-parameter to a String, freeing the allocation
///
/// # Safety
///
/// `pwstr` must be a CoTaskMem-allocated NUL-terminated wide string or null.
pub unsafe fn take_pwstr(pwstr: windows::core::PWSTR) -> Option<String> {
    if pwstr.is_null() {
        return None;
    }
    let text = pwstr.to_string().ok();
    CoTaskMemFree(Some(pwstr.as_ptr() as *const _));
    text
}
